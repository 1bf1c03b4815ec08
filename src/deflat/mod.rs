//! Control-flow deflattening engine.
//!
//! The pipeline runs in five stages: detect the flattened-loop pattern,
//! symbolically execute the dispatcher into a block graph, prune opaque
//! predicates and dead blocks, recover structured control flow, and emit
//! replacement statements spliced over the original loop.

pub mod block;
pub mod emit;
pub mod graph;
pub mod predicate;
pub mod state;
pub mod structure;

use std::collections::BTreeSet;

use oxc_allocator::{Allocator, Vec as AllocVec};
use oxc_ast::ast::{
    Expression, ForStatement, ForStatementInit, Statement, SwitchStatement, UnaryOperator,
    VariableDeclaration,
};
use oxc_ast_visit::{walk_mut, VisitMut};
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_span::{SourceType, Span};

use crate::deflat::block::DispatchWalker;
use crate::deflat::emit::emit_structured;
use crate::deflat::graph::DeflatGraph;
use crate::deflat::state::{FlatState, FlatValue};
use crate::deflat::structure::CfgRecovery;
use crate::error::{Error, Result};
use crate::solver::SolverBackend;

/// The dispatcher construct produced by control-flow flattening:
///
/// ```text
/// for (var K = <num>; void <num> !== K; ) {
///     var <derived keys>;
///     switch (<discriminant>) { ... }
/// }
/// ```
///
/// No update clause, and the body is exactly the derived-keys declaration
/// followed by the dispatch switch.
pub struct FlattenedLoop<'a> {
    pub loop_test: &'a Expression<'a>,
    pub derived_decl: &'a VariableDeclaration<'a>,
    pub dispatch: &'a SwitchStatement<'a>,
    /// The switching variable plus every derived key.
    pub tracked: BTreeSet<String>,
    pub initial_state: FlatState,
}

impl<'a> FlattenedLoop<'a> {
    /// Match `for_stmt` against the dispatcher shape. A mismatch is not an
    /// error; the statement is simply not a dispatcher.
    pub fn detect(for_stmt: &'a ForStatement<'a>) -> Option<FlattenedLoop<'a>> {
        if for_stmt.update.is_some() {
            return None;
        }
        let Some(ForStatementInit::VariableDeclaration(init_decl)) = &for_stmt.init else {
            return None;
        };
        if init_decl.declarations.len() != 1 {
            return None;
        }
        let declarator = &init_decl.declarations[0];
        let key = declarator.id.get_identifier_name()?;
        let Some(Expression::NumericLiteral(initial)) = &declarator.init else {
            return None;
        };

        let loop_test = for_stmt.test.as_ref()?;
        if !test_matches(loop_test, key.as_str()) {
            return None;
        }

        let Statement::BlockStatement(body) = &for_stmt.body else {
            return None;
        };
        if body.body.len() != 2 {
            return None;
        }
        let Statement::VariableDeclaration(derived_decl) = &body.body[0] else {
            return None;
        };
        let Statement::SwitchStatement(dispatch) = &body.body[1] else {
            return None;
        };

        let mut tracked = BTreeSet::new();
        tracked.insert(key.to_string());
        for derived in &derived_decl.declarations {
            tracked.insert(derived.id.get_identifier_name()?.to_string());
        }

        let mut initial_state = FlatState::new();
        initial_state.insert(key.to_string(), FlatValue::Num(initial.value));

        Some(FlattenedLoop {
            loop_test,
            derived_decl,
            dispatch,
            tracked,
            initial_state,
        })
    }
}

/// `void <num> !== K` in either operand order.
fn test_matches(test: &Expression<'_>, key: &str) -> bool {
    let mut test = test;
    while let Expression::ParenthesizedExpression(inner) = test {
        test = &inner.expression;
    }
    let Expression::BinaryExpression(binary) = test else {
        return false;
    };
    if binary.operator != oxc_ast::ast::BinaryOperator::StrictInequality {
        return false;
    }
    (is_void_number(&binary.left) && is_key_reference(&binary.right, key))
        || (is_void_number(&binary.right) && is_key_reference(&binary.left, key))
}

fn is_void_number(expr: &Expression<'_>) -> bool {
    matches!(
        expr,
        Expression::UnaryExpression(unary)
            if unary.operator == UnaryOperator::Void
                && matches!(unary.argument, Expression::NumericLiteral(_))
    )
}

fn is_key_reference(expr: &Expression<'_>, key: &str) -> bool {
    matches!(expr, Expression::Identifier(ident) if ident.name == key)
}

/// Whole-pipeline driver over one source file.
pub struct Deflattener {
    backend: Box<dyn SolverBackend>,
    capture_dot: bool,
    dot: Option<String>,
}

impl Deflattener {
    pub fn new(backend: Box<dyn SolverBackend>) -> Self {
        Deflattener {
            backend,
            capture_dot: false,
            dot: None,
        }
    }

    /// Keep a Graphviz rendering of the reduced graph for [`Self::take_dot`].
    pub fn capture_dot(mut self, enabled: bool) -> Self {
        self.capture_dot = enabled;
        self
    }

    pub fn take_dot(&mut self) -> Option<String> {
        self.dot.take()
    }

    /// Deflatten the dispatcher whose `for` statement starts on the 1-based
    /// `line`. Returns the rewritten program text, or `None` when no
    /// dispatcher is found there; the input is never partially rewritten.
    pub fn deflatten(&mut self, source: &str, line: usize) -> Result<Option<String>> {
        let allocator = Allocator::default();
        let parsed = Parser::new(&allocator, source, SourceType::cjs()).parse();
        if let Some(first) = parsed.errors.first() {
            return Err(Error::Parse {
                message: first.to_string(),
            });
        }
        let program = parsed.program;

        let (target_span, replacement) = {
            let Some(for_stmt) = find_for_on_line(&program.body, source, line) else {
                log::warn!("no for statement starts on line {line}");
                return Ok(None);
            };
            let Some(pattern) = FlattenedLoop::detect(for_stmt) else {
                log::warn!("for statement on line {line} is not a dispatcher");
                return Ok(None);
            };
            log::info!(
                "dispatcher on line {line}: {} tracked variable(s), {} case(s)",
                pattern.tracked.len(),
                pattern.dispatch.cases.len()
            );

            let walker = DispatchWalker {
                loop_test: pattern.loop_test,
                derived_decl: pattern.derived_decl,
                dispatch: pattern.dispatch,
                tracked: &pattern.tracked,
            };
            let mut graph = DeflatGraph::build(&walker, pattern.initial_state.clone())?;
            graph.reduce(self.backend.as_mut())?;
            if self.capture_dot {
                self.dot = Some(graph.to_dot());
            }

            let structured = CfgRecovery::structure(&graph)?;
            (for_stmt.span, emit_structured(&allocator, &graph, &structured)?)
        };

        // The residual references above borrow `program` for the arena's
        // lifetime, so the splice runs over a second parse of the same
        // source; spans are identical across parses.
        let mut spliced = Parser::new(&allocator, source, SourceType::cjs())
            .parse()
            .program;
        let mut splicer = LoopSplicer {
            target: target_span,
            replacement: Some(replacement),
        };
        splicer.visit_program(&mut spliced);
        if splicer.replacement.is_some() {
            return Err(Error::internal("target loop vanished before splicing"));
        }

        Ok(Some(Codegen::new().build(&spliced).code))
    }
}

/// Replaces the dispatcher `for` statement, identified by span, with the
/// recovered statements in the enclosing statement list.
struct LoopSplicer<'a> {
    target: Span,
    replacement: Option<AllocVec<'a, Statement<'a>>>,
}

impl<'a> VisitMut<'a> for LoopSplicer<'a> {
    fn visit_statements(&mut self, stmts: &mut AllocVec<'a, Statement<'a>>) {
        if self.replacement.is_none() {
            return;
        }
        let found = stmts.iter().position(
            |s| matches!(s, Statement::ForStatement(f) if f.span == self.target),
        );
        if let Some(idx) = found {
            if let Some(replacement) = self.replacement.take() {
                stmts.remove(idx);
                for (offset, stmt) in replacement.into_iter().enumerate() {
                    stmts.insert(idx + offset, stmt);
                }
            }
            return;
        }
        walk_mut::walk_statements(self, stmts);
    }
}

fn line_of_offset(source: &str, offset: u32) -> usize {
    let end = (offset as usize).min(source.len());
    source[..end].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Depth-first search for a `for` statement starting on `line`, descending
/// through the statement-bearing constructs a dispatcher can sit inside.
fn find_for_on_line<'a>(
    stmts: &'a [Statement<'a>],
    source: &str,
    line: usize,
) -> Option<&'a ForStatement<'a>> {
    for stmt in stmts {
        if let Some(found) = find_for_in_statement(stmt, source, line) {
            return Some(found);
        }
    }
    None
}

fn find_for_in_statement<'a>(
    stmt: &'a Statement<'a>,
    source: &str,
    line: usize,
) -> Option<&'a ForStatement<'a>> {
    match stmt {
        Statement::ForStatement(for_stmt) => {
            if line_of_offset(source, for_stmt.span.start) == line {
                return Some(for_stmt);
            }
            find_for_in_statement(&for_stmt.body, source, line)
        }
        Statement::BlockStatement(block) => find_for_on_line(&block.body, source, line),
        Statement::FunctionDeclaration(func) => func
            .body
            .as_ref()
            .and_then(|body| find_for_on_line(&body.statements, source, line)),
        Statement::IfStatement(if_stmt) => {
            find_for_in_statement(&if_stmt.consequent, source, line).or_else(|| {
                if_stmt
                    .alternate
                    .as_ref()
                    .and_then(|alt| find_for_in_statement(alt, source, line))
            })
        }
        Statement::WhileStatement(while_stmt) => {
            find_for_in_statement(&while_stmt.body, source, line)
        }
        Statement::DoWhileStatement(do_stmt) => find_for_in_statement(&do_stmt.body, source, line),
        Statement::ForInStatement(for_in) => find_for_in_statement(&for_in.body, source, line),
        Statement::ForOfStatement(for_of) => find_for_in_statement(&for_of.body, source, line),
        Statement::LabeledStatement(labeled) => {
            find_for_in_statement(&labeled.body, source, line)
        }
        Statement::TryStatement(try_stmt) => {
            find_for_on_line(&try_stmt.block.body, source, line)
                .or_else(|| {
                    try_stmt.handler.as_ref().and_then(|handler| {
                        find_for_on_line(&handler.body.body, source, line)
                    })
                })
                .or_else(|| {
                    try_stmt
                        .finalizer
                        .as_ref()
                        .and_then(|finalizer| find_for_on_line(&finalizer.body, source, line))
                })
        }
        Statement::SwitchStatement(switch) => switch
            .cases
            .iter()
            .find_map(|case| find_for_on_line(&case.consequent, source, line)),
        _ => None,
    }
}
