//! Constraint-solving boundary for opaque-predicate analysis.
//!
//! Predicates lifted out of the block graph are encoded into a small
//! three-sort term language (booleans, mathematical integers, 32-bit
//! bit-vectors) and handed to a [`SolverBackend`]. The backend reports
//! satisfiability; everything above this module only ever asks "is this
//! conjunction satisfiable", never for models.

use std::collections::BTreeMap;

use crate::error::Result;

pub mod enumerate;
#[cfg(feature = "z3")]
pub mod z3;

pub use enumerate::EnumerationBackend;

/// Sorts of the term language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Bool,
    Int,
    /// 32-bit bit-vector, used for JS bitwise operator semantics.
    Bv32,
}

/// A term over booleans, unbounded integers and 32-bit bit-vectors.
///
/// The encoder keeps integer arithmetic in `Int` and moves to `Bv32` only
/// around bitwise operators, with explicit reinterpretation casts at the
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    BoolLit(bool),
    IntLit(i64),
    BvLit(i32),
    Const { name: String, sort: Sort },

    Not(Box<Term>),
    And(Box<Term>, Box<Term>),
    Or(Box<Term>, Box<Term>),

    /// Equality over two terms of the same sort.
    Eq(Box<Term>, Box<Term>),

    Lt(Box<Term>, Box<Term>),
    Le(Box<Term>, Box<Term>),
    Gt(Box<Term>, Box<Term>),
    Ge(Box<Term>, Box<Term>),

    Neg(Box<Term>),
    Add(Box<Term>, Box<Term>),
    Sub(Box<Term>, Box<Term>),
    Mul(Box<Term>, Box<Term>),

    BvNot(Box<Term>),
    BvAnd(Box<Term>, Box<Term>),
    BvOr(Box<Term>, Box<Term>),
    BvXor(Box<Term>, Box<Term>),
    BvShl(Box<Term>, Box<Term>),
    BvAshr(Box<Term>, Box<Term>),
    BvLshr(Box<Term>, Box<Term>),
    BvUrem(Box<Term>, Box<Term>),

    /// Signed reinterpretation of a 32-bit vector as an integer.
    BvToInt(Box<Term>),
    /// Truncating reinterpretation of an integer as a 32-bit vector
    /// (the ToInt32 conversion JS applies before bitwise operators).
    IntToBv(Box<Term>),
}

impl Term {
    pub fn boolean(name: impl Into<String>) -> Term {
        Term::Const {
            name: name.into(),
            sort: Sort::Bool,
        }
    }

    pub fn int(name: impl Into<String>) -> Term {
        Term::Const {
            name: name.into(),
            sort: Sort::Int,
        }
    }

    pub fn negated(self) -> Term {
        Term::Not(Box::new(self))
    }

    /// Sort of this term. Encoding keeps operand sorts consistent, so a
    /// plain structural recursion is enough.
    pub fn sort(&self) -> Sort {
        match self {
            Term::BoolLit(_) => Sort::Bool,
            Term::IntLit(_) => Sort::Int,
            Term::BvLit(_) => Sort::Bv32,
            Term::Const { sort, .. } => *sort,
            Term::Not(_)
            | Term::And(..)
            | Term::Or(..)
            | Term::Eq(..)
            | Term::Lt(..)
            | Term::Le(..)
            | Term::Gt(..)
            | Term::Ge(..) => Sort::Bool,
            Term::Neg(_) | Term::Add(..) | Term::Sub(..) | Term::Mul(..) | Term::BvToInt(_) => {
                Sort::Int
            }
            Term::BvNot(_)
            | Term::BvAnd(..)
            | Term::BvOr(..)
            | Term::BvXor(..)
            | Term::BvShl(..)
            | Term::BvAshr(..)
            | Term::BvLshr(..)
            | Term::BvUrem(..)
            | Term::IntToBv(_) => Sort::Bv32,
        }
    }

    /// Collect the free constants of this term into `out`, keyed by name.
    pub fn collect_consts(&self, out: &mut BTreeMap<String, Sort>) {
        match self {
            Term::BoolLit(_) | Term::IntLit(_) | Term::BvLit(_) => {}
            Term::Const { name, sort } => {
                out.insert(name.clone(), *sort);
            }
            Term::Not(a)
            | Term::Neg(a)
            | Term::BvNot(a)
            | Term::BvToInt(a)
            | Term::IntToBv(a) => a.collect_consts(out),
            Term::And(a, b)
            | Term::Or(a, b)
            | Term::Eq(a, b)
            | Term::Lt(a, b)
            | Term::Le(a, b)
            | Term::Gt(a, b)
            | Term::Ge(a, b)
            | Term::Add(a, b)
            | Term::Sub(a, b)
            | Term::Mul(a, b)
            | Term::BvAnd(a, b)
            | Term::BvOr(a, b)
            | Term::BvXor(a, b)
            | Term::BvShl(a, b)
            | Term::BvAshr(a, b)
            | Term::BvLshr(a, b)
            | Term::BvUrem(a, b) => {
                a.collect_consts(out);
                b.collect_consts(out);
            }
        }
    }

    /// Collect the integer literals appearing anywhere in the term.
    pub fn collect_int_literals(&self, out: &mut Vec<i64>) {
        match self {
            Term::BoolLit(_) | Term::Const { .. } => {}
            Term::IntLit(v) => out.push(*v),
            Term::BvLit(v) => out.push(*v as i64),
            Term::Not(a)
            | Term::Neg(a)
            | Term::BvNot(a)
            | Term::BvToInt(a)
            | Term::IntToBv(a) => a.collect_int_literals(out),
            Term::And(a, b)
            | Term::Or(a, b)
            | Term::Eq(a, b)
            | Term::Lt(a, b)
            | Term::Le(a, b)
            | Term::Gt(a, b)
            | Term::Ge(a, b)
            | Term::Add(a, b)
            | Term::Sub(a, b)
            | Term::Mul(a, b)
            | Term::BvAnd(a, b)
            | Term::BvOr(a, b)
            | Term::BvXor(a, b)
            | Term::BvShl(a, b)
            | Term::BvAshr(a, b)
            | Term::BvLshr(a, b)
            | Term::BvUrem(a, b) => {
                a.collect_int_literals(out);
                b.collect_int_literals(out);
            }
        }
    }
}

/// Satisfiability verdict for a conjunction of assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sat {
    Sat,
    Unsat,
    Unknown,
}

/// A satisfiability oracle for conjunctions of boolean-sorted terms.
pub trait SolverBackend {
    fn name(&self) -> &'static str;

    /// Check whether the conjunction of `assertions` is satisfiable.
    fn check(&mut self, assertions: &[Term]) -> Result<Sat>;
}

/// Backend used when constraint solving is disabled. Every query is
/// inconclusive, so no fork is ever pruned.
#[derive(Debug, Default)]
pub struct NullBackend;

impl SolverBackend for NullBackend {
    fn name(&self) -> &'static str {
        "off"
    }

    fn check(&mut self, _assertions: &[Term]) -> Result<Sat> {
        Ok(Sat::Unknown)
    }
}

/// How many times an `Unknown` verdict is retried before the query is
/// abandoned as inconclusive.
pub const UNKNOWN_RETRY_LIMIT: u32 = 3;

/// Check with the bounded retry policy for `Unknown` verdicts.
pub fn check_with_retry(backend: &mut dyn SolverBackend, assertions: &[Term]) -> Result<Sat> {
    for attempt in 0..UNKNOWN_RETRY_LIMIT {
        match backend.check(assertions)? {
            Sat::Unknown => {
                log::debug!(
                    "solver {} returned unknown (attempt {}/{})",
                    backend.name(),
                    attempt + 1,
                    UNKNOWN_RETRY_LIMIT
                );
            }
            verdict => return Ok(verdict),
        }
    }
    Ok(Sat::Unknown)
}
