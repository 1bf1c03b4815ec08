//! Opaque-predicate analysis for fork conditions.
//!
//! A fork test is lowered into the solver term language: numeric
//! subexpressions become integer terms, bitwise operators detour through
//! 32-bit bit-vectors with explicit reinterpretation casts, and boolean
//! subexpressions used in arithmetic positions are lifted into fresh
//! `@temp` constants constrained to 0 or 1. Assignment expressions nested
//! inside the predicate are split into SSA bindings so the remaining
//! predicate is pure.
//!
//! The analyser then asks the backend for the satisfiability of
//! {constraints ∧ P} and {constraints ∧ ¬P}. Exactly one unsatisfiable
//! side proves the fork one-sided. When both sides are satisfiable the
//! context is widened by walking the single-predecessor chain backwards
//! and pulling residual assignments to free symbols into the constraint
//! set, stopping at branch points and variable declarations.

use std::collections::BTreeMap;

use oxc_ast::ast::{
    AssignmentOperator, AssignmentTarget, BinaryOperator, Expression, LogicalOperator, Statement,
    UnaryOperator,
};
use petgraph::graph::NodeIndex;

use crate::deflat::block::Residual;
use crate::deflat::graph::DeflatGraph;
use crate::error::{Error, Result};
use crate::solver::{check_with_retry, Sat, SolverBackend, Term};

/// SSA lowering state shared by the predicate and pulled constraints.
#[derive(Debug, Default)]
struct Lowering {
    /// Current solver symbol for each JS variable.
    symbols: BTreeMap<String, String>,
    next_version: u32,
    next_temp: u32,
    constraints: Vec<Term>,
}

impl Lowering {
    fn current_symbol(&mut self, name: &str) -> String {
        self.symbols
            .entry(name.to_string())
            .or_insert_with(|| name.to_string())
            .clone()
    }

    fn fresh_version(&mut self, name: &str) -> String {
        self.next_version += 1;
        let symbol = format!("{name}@{}", self.next_version);
        self.symbols.insert(name.to_string(), symbol.clone());
        symbol
    }

    fn fresh_temp(&mut self) -> String {
        let symbol = format!("@temp{}", self.next_temp);
        self.next_temp += 1;
        symbol
    }

    /// Lift a boolean term into an integer constant constrained to 0/1.
    fn lift_bool_to_int(&mut self, cond: Term) -> Term {
        let temp = Term::int(self.fresh_temp());
        let is_one = Term::Eq(Box::new(temp.clone()), Box::new(Term::IntLit(1)));
        let is_zero = Term::Eq(Box::new(temp.clone()), Box::new(Term::IntLit(0)));
        self.constraints.push(Term::Or(
            Box::new(Term::And(Box::new(cond.clone()), Box::new(is_one))),
            Box::new(Term::And(Box::new(cond.negated()), Box::new(is_zero))),
        ));
        temp
    }

    /// Encode in boolean position. `Ok(None)` means unanalysable.
    fn encode_bool(&mut self, expr: &Expression<'_>) -> Result<Option<Term>> {
        Ok(match expr {
            Expression::BooleanLiteral(lit) => Some(Term::BoolLit(lit.value)),
            Expression::ParenthesizedExpression(inner) => self.encode_bool(&inner.expression)?,

            Expression::UnaryExpression(unary) if unary.operator == UnaryOperator::LogicalNot => {
                self.encode_bool(&unary.argument)?.map(Term::negated)
            }

            Expression::LogicalExpression(logical) => {
                let (Some(left), Some(right)) = (
                    self.encode_bool(&logical.left)?,
                    self.encode_bool(&logical.right)?,
                ) else {
                    return Ok(None);
                };
                match logical.operator {
                    LogicalOperator::And => Some(Term::And(Box::new(left), Box::new(right))),
                    LogicalOperator::Or => Some(Term::Or(Box::new(left), Box::new(right))),
                    LogicalOperator::Coalesce => None,
                }
            }

            Expression::BinaryExpression(binary) => {
                let cmp = |this: &mut Self,
                           build: fn(Box<Term>, Box<Term>) -> Term|
                 -> Result<Option<Term>> {
                    let (Some(l), Some(r)) = (
                        this.encode_int(&binary.left)?,
                        this.encode_int(&binary.right)?,
                    ) else {
                        return Ok(None);
                    };
                    Ok(Some(build(Box::new(l), Box::new(r))))
                };
                match binary.operator {
                    BinaryOperator::LessThan => cmp(self, Term::Lt)?,
                    BinaryOperator::LessEqualThan => cmp(self, Term::Le)?,
                    BinaryOperator::GreaterThan => cmp(self, Term::Gt)?,
                    BinaryOperator::GreaterEqualThan => cmp(self, Term::Ge)?,
                    BinaryOperator::Equality | BinaryOperator::StrictEquality => {
                        cmp(self, Term::Eq)?
                    }
                    BinaryOperator::Inequality | BinaryOperator::StrictInequality => {
                        cmp(self, Term::Eq)?.map(Term::negated)
                    }
                    _ => None,
                }
            }

            _ => None,
        })
    }

    /// Encode in integer position.
    fn encode_int(&mut self, expr: &Expression<'_>) -> Result<Option<Term>> {
        Ok(match expr {
            Expression::NumericLiteral(lit) => int_literal(lit.value),
            Expression::ParenthesizedExpression(inner) => self.encode_int(&inner.expression)?,

            Expression::Identifier(ident) => {
                Some(Term::int(self.current_symbol(ident.name.as_str())))
            }

            Expression::UnaryExpression(unary) => match unary.operator {
                UnaryOperator::UnaryNegation => self
                    .encode_int(&unary.argument)?
                    .map(|t| Term::Neg(Box::new(t))),
                UnaryOperator::UnaryPlus => self.encode_int(&unary.argument)?,
                UnaryOperator::BitwiseNot => self.encode_int(&unary.argument)?.map(|t| {
                    Term::BvToInt(Box::new(Term::BvNot(Box::new(Term::IntToBv(Box::new(t))))))
                }),
                UnaryOperator::LogicalNot => {
                    let Some(cond) = self.encode_bool(expr)? else {
                        return Ok(None);
                    };
                    Some(self.lift_bool_to_int(cond))
                }
                _ => None,
            },

            Expression::BinaryExpression(binary) => {
                match binary.operator {
                    BinaryOperator::Addition
                    | BinaryOperator::Subtraction
                    | BinaryOperator::Multiplication => {
                        let (Some(l), Some(r)) = (
                            self.encode_int(&binary.left)?,
                            self.encode_int(&binary.right)?,
                        ) else {
                            return Ok(None);
                        };
                        let build = match binary.operator {
                            BinaryOperator::Addition => Term::Add,
                            BinaryOperator::Subtraction => Term::Sub,
                            _ => Term::Mul,
                        };
                        Some(build(Box::new(l), Box::new(r)))
                    }

                    BinaryOperator::BitwiseAnd
                    | BinaryOperator::BitwiseOR
                    | BinaryOperator::BitwiseXOR => {
                        let (Some(l), Some(r)) = (
                            self.encode_int(&binary.left)?,
                            self.encode_int(&binary.right)?,
                        ) else {
                            return Ok(None);
                        };
                        let build = match binary.operator {
                            BinaryOperator::BitwiseAnd => Term::BvAnd,
                            BinaryOperator::BitwiseOR => Term::BvOr,
                            _ => Term::BvXor,
                        };
                        Some(Term::BvToInt(Box::new(build(
                            Box::new(Term::IntToBv(Box::new(l))),
                            Box::new(Term::IntToBv(Box::new(r))),
                        ))))
                    }

                    BinaryOperator::ShiftLeft
                    | BinaryOperator::ShiftRight
                    | BinaryOperator::ShiftRightZeroFill => {
                        let (Some(l), Some(r)) = (
                            self.encode_int(&binary.left)?,
                            self.encode_int(&binary.right)?,
                        ) else {
                            return Ok(None);
                        };
                        let build = match binary.operator {
                            BinaryOperator::ShiftLeft => Term::BvShl,
                            BinaryOperator::ShiftRight => Term::BvAshr,
                            _ => Term::BvLshr,
                        };
                        // JS masks the shift count to five bits.
                        let amount = Term::BvUrem(
                            Box::new(Term::IntToBv(Box::new(r))),
                            Box::new(Term::BvLit(32)),
                        );
                        Some(Term::BvToInt(Box::new(build(
                            Box::new(Term::IntToBv(Box::new(l))),
                            Box::new(amount),
                        ))))
                    }

                    // Comparison in arithmetic position coerces to 0/1.
                    BinaryOperator::LessThan
                    | BinaryOperator::LessEqualThan
                    | BinaryOperator::GreaterThan
                    | BinaryOperator::GreaterEqualThan
                    | BinaryOperator::Equality
                    | BinaryOperator::Inequality
                    | BinaryOperator::StrictEquality
                    | BinaryOperator::StrictInequality => {
                        let Some(cond) = self.encode_bool(expr)? else {
                            return Ok(None);
                        };
                        Some(self.lift_bool_to_int(cond))
                    }

                    _ => None,
                }
            }

            // SSA split: bind the assigned value to a fresh version and
            // let the assignment evaluate to it.
            Expression::AssignmentExpression(assign)
                if assign.operator == AssignmentOperator::Assign =>
            {
                let AssignmentTarget::AssignmentTargetIdentifier(target) = &assign.left else {
                    return Ok(None);
                };
                let Some(value) = self.encode_int(&assign.right)? else {
                    return Ok(None);
                };
                let version = Term::int(self.fresh_version(target.name.as_str()));
                self.constraints
                    .push(Term::Eq(Box::new(version.clone()), Box::new(value)));
                Some(version)
            }

            _ => None,
        })
    }

    /// Constrain the current symbol of `name` to equal `value_expr`, read
    /// in the pre-assignment environment. Used by the backward walk.
    fn pull_assignment(&mut self, name: &str, value_expr: &Expression<'_>) -> Result<bool> {
        let current = self.current_symbol(name);
        // Reads of `name` inside the value belong to the pre-image.
        self.fresh_version(name);
        let Some(value) = self.encode_int(value_expr)? else {
            // Roll the symbol forward again; the walk stops here anyway.
            self.symbols.insert(name.to_string(), current);
            return Ok(false);
        };
        self.constraints.push(Term::Eq(
            Box::new(Term::int(current)),
            Box::new(value),
        ));
        Ok(true)
    }

    fn free_symbols(&self, predicate: &Term) -> BTreeMap<String, crate::solver::Sort> {
        let mut consts = BTreeMap::new();
        predicate.collect_consts(&mut consts);
        for c in &self.constraints {
            c.collect_consts(&mut consts);
        }
        consts
    }
}

fn int_literal(value: f64) -> Option<Term> {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(Term::IntLit(value as i64))
    } else {
        None
    }
}

/// Decides whether a fork condition is one-sided.
pub struct PredicateAnalyser<'g, 'a> {
    graph: &'g DeflatGraph<'a>,
    node: NodeIndex,
}

enum Verdict {
    Always(bool),
    Undecided,
}

impl<'g, 'a> PredicateAnalyser<'g, 'a> {
    pub fn new(graph: &'g DeflatGraph<'a>, node: NodeIndex) -> Self {
        PredicateAnalyser { graph, node }
    }

    /// `Some(true)`: the condition always holds; `Some(false)`: it never
    /// holds; `None`: inconclusive, the fork stays.
    pub fn analyse(&self, backend: &mut dyn SolverBackend) -> Result<Option<bool>> {
        let block = self.graph.block(self.node);
        let Some(fork) = &block.fork else {
            return Ok(None);
        };

        let mut lowering = Lowering::default();
        let Some(predicate) = lowering.encode_bool(fork.test)? else {
            return Ok(None);
        };

        match self.twin_check(backend, &lowering, &predicate)? {
            Verdict::Always(always) => return Ok(Some(always)),
            Verdict::Undecided => {}
        }

        // Widen with assignments from the backward single-predecessor
        // chain, starting with this block's own residual code.
        let mut node = self.node;
        let mut first = true;
        loop {
            let residuals = &self.graph.block(node).residual;
            for residual in residuals.iter().rev() {
                let Some((name, value_expr)) = residual_assignment(residual) else {
                    if residual_is_declaration(residual) {
                        return Ok(None);
                    }
                    continue;
                };
                let current = lowering.current_symbol(name);
                if !lowering.free_symbols(&predicate).contains_key(&current) {
                    continue;
                }
                if !lowering.pull_assignment(name, value_expr)? {
                    return Ok(None);
                }
                match self.twin_check(backend, &lowering, &predicate)? {
                    Verdict::Always(always) => return Ok(Some(always)),
                    Verdict::Undecided => {}
                }
            }

            // Branch points end the walk: with several predecessors the
            // pulled assignments would depend on the path taken.
            if !first && self.graph.block(node).fork.is_some() {
                return Ok(None);
            }
            first = false;
            let preds = self.graph.predecessors(node);
            if preds.len() != 1 || preds[0] == node {
                return Ok(None);
            }
            node = preds[0];
        }
    }

    fn twin_check(
        &self,
        backend: &mut dyn SolverBackend,
        lowering: &Lowering,
        predicate: &Term,
    ) -> Result<Verdict> {
        let mut with_p = lowering.constraints.clone();
        with_p.push(predicate.clone());
        let mut with_not_p = lowering.constraints.clone();
        with_not_p.push(predicate.clone().negated());

        let sat_p = check_with_retry(backend, &with_p)?;
        let sat_not_p = check_with_retry(backend, &with_not_p)?;

        match (sat_p, sat_not_p) {
            (Sat::Sat, Sat::Unsat) => Ok(Verdict::Always(true)),
            (Sat::Unsat, Sat::Sat) => Ok(Verdict::Always(false)),
            (Sat::Unsat, Sat::Unsat) => Err(Error::internal(
                "predicate and its negation are both unsatisfiable".to_string(),
            )),
            _ => Ok(Verdict::Undecided),
        }
    }
}

/// `name = expr` when the residual entry is a plain assignment.
fn residual_assignment<'r, 'a>(residual: &'r Residual<'a>) -> Option<(&'r str, &'r Expression<'a>)> {
    let expr = match residual {
        Residual::Stmt(Statement::ExpressionStatement(stmt)) => &stmt.expression,
        Residual::Expr(expr) => expr,
        _ => return None,
    };
    let Expression::AssignmentExpression(assign) = expr else {
        return None;
    };
    if assign.operator != AssignmentOperator::Assign {
        return None;
    }
    let AssignmentTarget::AssignmentTargetIdentifier(target) = &assign.left else {
        return None;
    };
    Some((target.name.as_str(), &assign.right))
}

fn residual_is_declaration(residual: &Residual<'_>) -> bool {
    matches!(residual, Residual::Stmt(Statement::VariableDeclaration(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflat::block::{DeflatBlock, Fork};
    use crate::deflat::graph::EdgeKind;
    use crate::deflat::state::FlatState;
    use crate::solver::EnumerationBackend;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;
    use petgraph::graph::DiGraph;

    fn first_expression<'a>(
        program: &'a oxc_ast::ast::Program<'a>,
        index: usize,
    ) -> &'a Expression<'a> {
        match &program.body[index] {
            Statement::ExpressionStatement(stmt) => &stmt.expression,
            other => panic!("fixture statement {index} is not an expression: {other:?}"),
        }
    }

    fn fork_graph<'a>(
        test: &'a Expression<'a>,
        residual: Vec<Residual<'a>>,
    ) -> (DeflatGraph<'a>, NodeIndex) {
        let mut graph = DiGraph::new();
        let exit = graph.add_node(DeflatBlock::exit_sentinel());
        let mut block = DeflatBlock::default();
        block.residual = residual;
        block.switching_state = Some(FlatState::new());
        block.fork = Some(Fork {
            test,
            true_state: FlatState::new(),
            false_state: FlatState::new(),
        });
        let node = graph.add_node(block);
        graph.add_edge(node, exit, EdgeKind::True);
        graph.add_edge(node, exit, EdgeKind::False);
        (
            DeflatGraph {
                graph,
                exit,
                start: node,
            },
            node,
        )
    }

    #[test]
    fn test_pulled_assignment_decides_always_true() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "r = 5; r + 1 > r;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let residual = vec![Residual::Stmt(&program.body[0])];
        let (g, node) = fork_graph(first_expression(&program, 1), residual);
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, Some(true));
    }

    #[test]
    fn test_pulled_assignment_decides_always_false() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "r = 2; r > 3;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let residual = vec![Residual::Stmt(&program.body[0])];
        let (g, node) = fork_graph(first_expression(&program, 1), residual);
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, Some(false));
    }

    #[test]
    fn test_unconstrained_tautology_is_inconclusive() {
        // Nothing binds n, so the enumeration backend cannot prove the
        // negation unsatisfiable and the fork must stay.
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "n + 1 > n;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let (g, node) = fork_graph(first_expression(&program, 0), Vec::new());
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, None);
    }

    #[test]
    fn test_contingent_predicate_is_inconclusive() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "a < 10;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let (g, node) = fork_graph(first_expression(&program, 0), Vec::new());
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, None);
    }

    #[test]
    fn test_backward_pull_decides_with_context() {
        // r = 5 in the same block makes r > 3 decidable
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "r = 5; r > 3;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let residual = vec![Residual::Stmt(&program.body[0])];
        let (g, node) = fork_graph(first_expression(&program, 1), residual);
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, Some(true));
    }

    #[test]
    fn test_unanalysable_predicate_is_inconclusive() {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, "f(x) > 0;", SourceType::cjs()).parse();
        assert!(ret.errors.is_empty());
        let program = ret.program;
        let (g, node) = fork_graph(first_expression(&program, 0), Vec::new());
        let verdict = PredicateAnalyser::new(&g, node)
            .analyse(&mut EnumerationBackend::new())
            .unwrap();
        assert_eq!(verdict, None);
    }
}
