//! Re-emission of the structured tree as JavaScript statements.
//!
//! Residual code is deep-cloned out of the original AST; everything
//! synthetic (tests, blocks, labels, break/continue) is built fresh.
//! Loop shaping happens here: a loop whose body leads with a bare exit
//! test becomes `while`/`for`, one that ends with the exit test becomes
//! `do`-`while`, anything else stays `while (true)`.

use std::collections::BTreeMap;

use oxc_allocator::{Allocator, CloneIn, Vec as AllocVec};
use oxc_ast::ast::{Expression, Statement, UnaryOperator};
use oxc_ast::AstBuilder;
use oxc_span::SPAN;
use petgraph::graph::NodeIndex;

use crate::deflat::block::Residual;
use crate::deflat::graph::DeflatGraph;
use crate::deflat::structure::{Element, StructuredCfg};
use crate::error::{Error, Result};

/// Render `structured` into a flat statement list.
pub fn emit_structured<'a>(
    allocator: &'a Allocator,
    graph: &DeflatGraph<'a>,
    structured: &StructuredCfg,
) -> Result<AllocVec<'a, Statement<'a>>> {
    let mut emitter = AstEmitter {
        ast: AstBuilder::new(allocator),
        graph,
        labels: &structured.labels,
        loop_stack: Vec::new(),
    };
    let mut out = emitter.ast.vec();
    emitter.emit_element(&structured.root, &mut out)?;
    Ok(out)
}

struct AstEmitter<'a, 'g> {
    ast: AstBuilder<'a>,
    graph: &'g DeflatGraph<'a>,
    labels: &'g BTreeMap<usize, String>,
    /// Loop ids of the loops currently being emitted, outermost first.
    loop_stack: Vec<usize>,
}

impl<'a, 'g> AstEmitter<'a, 'g> {
    fn emit_element(
        &mut self,
        element: &Element,
        out: &mut AllocVec<'a, Statement<'a>>,
    ) -> Result<()> {
        match element {
            Element::Block(node) => {
                self.emit_block_code(*node, out);
                Ok(())
            }
            Element::Seq(items) => {
                for item in items {
                    self.emit_element(item, out)?;
                }
                Ok(())
            }
            Element::If {
                cond,
                true_body,
                false_body,
            } => self.emit_if(*cond, true_body.as_deref(), false_body.as_deref(), out),
            Element::IfEscape {
                cond,
                escape_cond,
                body,
            } => self.emit_if_escape(*cond, *escape_cond, body, out),
            Element::Loop {
                id,
                loopin,
                continue_node,
                body,
            } => self.emit_loop(*id, *loopin, *continue_node, body, out),
            Element::Break { level } => {
                out.push(self.ast.statement_break(SPAN, self.exit_label(*level)?));
                Ok(())
            }
            Element::Continue { level } => {
                out.push(self.ast.statement_continue(SPAN, self.exit_label(*level)?));
                Ok(())
            }
        }
    }

    /// Residual statements of one block, plus its pruned fork condition
    /// (kept alive for its side effects).
    fn emit_block_code(&mut self, node: NodeIndex, out: &mut AllocVec<'a, Statement<'a>>) {
        let block = self.graph.block(node);
        for residual in &block.residual {
            match residual {
                Residual::Stmt(stmt) => out.push(stmt.clone_in(self.ast.allocator)),
                Residual::Expr(expr) => out.push(
                    self.ast
                        .statement_expression(SPAN, expr.clone_in(self.ast.allocator)),
                ),
            }
        }
        if let Some(bogus) = block.bogus_fork {
            out.push(
                self.ast
                    .statement_expression(SPAN, bogus.clone_in(self.ast.allocator)),
            );
        }
    }

    fn fork_test(&self, node: NodeIndex) -> Result<Expression<'a>> {
        let fork = self.graph.block(node).fork.as_ref().ok_or_else(|| {
            Error::internal(format!("block {} lost its fork condition", node.index()))
        })?;
        Ok(fork.test.clone_in(self.ast.allocator))
    }

    fn negate(&self, expr: Expression<'a>) -> Expression<'a> {
        self.ast
            .expression_unary(SPAN, UnaryOperator::LogicalNot, expr)
    }

    fn emit_body_block(&mut self, body: &Element) -> Result<Statement<'a>> {
        let mut stmts = self.ast.vec();
        self.emit_element(body, &mut stmts)?;
        Ok(self.ast.statement_block(SPAN, stmts))
    }

    fn emit_if(
        &mut self,
        cond: NodeIndex,
        true_body: Option<&Element>,
        false_body: Option<&Element>,
        out: &mut AllocVec<'a, Statement<'a>>,
    ) -> Result<()> {
        self.emit_block_code(cond, out);
        let test = self.fork_test(cond)?;
        let stmt = match (true_body, false_body) {
            (Some(t), None) => {
                let consequent = self.emit_body_block(t)?;
                self.ast.statement_if(SPAN, test, consequent, None)
            }
            (None, Some(f)) => {
                let consequent = self.emit_body_block(f)?;
                self.ast
                    .statement_if(SPAN, self.negate(test), consequent, None)
            }
            (Some(t), Some(f)) => {
                let consequent = self.emit_body_block(t)?;
                let alternate = self.emit_body_block(f)?;
                self.ast
                    .statement_if(SPAN, test, consequent, Some(alternate))
            }
            (None, None) => {
                return Err(Error::internal(format!(
                    "branch block {} has no bodies",
                    cond.index()
                )))
            }
        };
        out.push(stmt);
        Ok(())
    }

    fn emit_if_escape(
        &mut self,
        cond: NodeIndex,
        escape_cond: bool,
        body: &Element,
        out: &mut AllocVec<'a, Statement<'a>>,
    ) -> Result<()> {
        self.emit_block_code(cond, out);
        let test = self.fork_test(cond)?;
        let test = if escape_cond { test } else { self.negate(test) };
        let body_block = self.emit_body_block(body)?;
        out.push(self.ast.statement_if(SPAN, test, body_block, None));
        Ok(())
    }

    fn emit_loop(
        &mut self,
        id: usize,
        loopin: NodeIndex,
        continue_node: NodeIndex,
        body: &Element,
        out: &mut AllocVec<'a, Statement<'a>>,
    ) -> Result<()> {
        let Element::Seq(items) = body else {
            return Err(Error::internal("loop body is not a sequence"));
        };

        self.loop_stack.push(id);
        let result = self.emit_loop_shape(loopin, continue_node, items);
        self.loop_stack.pop();
        let stmt = result?;

        let stmt = match self.labels.get(&id) {
            Some(name) => {
                let label = self.ast.label_identifier(SPAN, self.ast.atom(name));
                self.ast.statement_labeled(SPAN, label, stmt)
            }
            None => stmt,
        };
        out.push(stmt);
        Ok(())
    }

    fn emit_loop_shape(
        &mut self,
        loopin: NodeIndex,
        continue_node: NodeIndex,
        items: &[Element],
    ) -> Result<Statement<'a>> {
        // Exit test at the head of the body: `while` or `for`.
        if let Some((cond, escape_cond)) = self.leading_exit_test(items) {
            let test = self.fork_test(cond)?;
            let test = if escape_cond { self.negate(test) } else { test };
            let mut stmts = self.ast.vec();
            for item in &items[1..] {
                self.emit_element(item, &mut stmts)?;
            }
            let body = self.ast.statement_block(SPAN, stmts);
            return if loopin == continue_node {
                Ok(self.ast.statement_while(SPAN, test, body))
            } else {
                let update = self.update_expression(continue_node)?;
                Ok(self
                    .ast
                    .statement_for(SPAN, None, Some(test), update, body))
            };
        }

        // Exit test at the tail: `do`-`while`.
        if items.len() > 1 {
            if let Some((cond, escape_cond)) = exit_test(items.last()) {
                let test = self.fork_test(cond)?;
                let test = if escape_cond { self.negate(test) } else { test };
                let mut stmts = self.ast.vec();
                for item in &items[..items.len() - 1] {
                    self.emit_element(item, &mut stmts)?;
                }
                self.emit_block_code(cond, &mut stmts);
                let body = self.ast.statement_block(SPAN, stmts);
                return Ok(self.ast.statement_do_while(SPAN, body, test));
            }
        }

        let mut stmts = self.ast.vec();
        for item in items {
            self.emit_element(item, &mut stmts)?;
        }
        let body = self.ast.statement_block(SPAN, stmts);
        let test = self.ast.expression_boolean_literal(SPAN, true);
        Ok(self.ast.statement_while(SPAN, test, body))
    }

    /// A head exit test must carry no residual code of its own, or hoisting
    /// it into the loop condition would reorder effects.
    fn leading_exit_test(&self, items: &[Element]) -> Option<(NodeIndex, bool)> {
        let (cond, escape_cond) = exit_test(items.first())?;
        let block = self.graph.block(cond);
        if block.residual.is_empty() && block.bogus_fork.is_none() {
            Some((cond, escape_cond))
        } else {
            None
        }
    }

    /// Update clause of a `for` rendered from the distinct continue block.
    fn update_expression(&self, continue_node: NodeIndex) -> Result<Option<Expression<'a>>> {
        let block = self.graph.block(continue_node);
        let mut exprs: Vec<Expression<'a>> = Vec::new();
        for residual in &block.residual {
            let expr = match residual {
                Residual::Expr(expr) => expr,
                Residual::Stmt(Statement::ExpressionStatement(stmt)) => &stmt.expression,
                Residual::Stmt(_) => {
                    return Err(Error::structuring(
                        "loop update block holds a non-expression statement".to_string(),
                    ))
                }
            };
            exprs.push(expr.clone_in(self.ast.allocator));
        }
        if let Some(bogus) = block.bogus_fork {
            exprs.push(bogus.clone_in(self.ast.allocator));
        }
        Ok(match exprs.len() {
            0 => None,
            1 => exprs.pop(),
            _ => Some(
                self.ast
                    .expression_sequence(SPAN, self.ast.vec_from_iter(exprs)),
            ),
        })
    }

    fn exit_label(
        &self,
        level: usize,
    ) -> Result<Option<oxc_ast::ast::LabelIdentifier<'a>>> {
        if level == 0 {
            return Ok(None);
        }
        let target = self
            .loop_stack
            .len()
            .checked_sub(1 + level)
            .and_then(|i| self.loop_stack.get(i))
            .ok_or_else(|| Error::internal("break/continue level exceeds loop nesting"))?;
        let name = self.labels.get(target).ok_or_else(|| {
            Error::internal(format!("loop {target} was never assigned a label"))
        })?;
        Ok(Some(self.ast.label_identifier(SPAN, self.ast.atom(name))))
    }
}

/// An escape element whose body is exactly an innermost `break`, which is
/// what a loop exit test looks like after recovery.
fn exit_test(item: Option<&Element>) -> Option<(NodeIndex, bool)> {
    let Some(Element::IfEscape {
        cond,
        escape_cond,
        body,
    }) = item
    else {
        return None;
    };
    let Element::Seq(items) = body.as_ref() else {
        return None;
    };
    match items.first() {
        Some(Element::Break { level: 0 }) => Some((*cond, *escape_cond)),
        _ => None,
    }
}
