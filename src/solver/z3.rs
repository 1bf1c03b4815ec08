//! SMT backend over the `z3` crate.
//!
//! Each check builds a fresh context and solver so no state leaks between
//! queries and the native resources are released as soon as the verdict is
//! in.

use z3::ast::{Ast, Bool, Int, BV};
use z3::{Config, Context, SatResult, Solver};

use crate::error::{Error, Result};

use super::{Sat, SolverBackend, Term};

#[derive(Debug, Default)]
pub struct Z3Backend;

enum Lowered<'ctx> {
    B(Bool<'ctx>),
    I(Int<'ctx>),
    V(BV<'ctx>),
}

impl<'ctx> Lowered<'ctx> {
    fn boolean(self) -> Result<Bool<'ctx>> {
        match self {
            Lowered::B(b) => Ok(b),
            _ => Err(Error::Solver {
                message: "expected a boolean term".to_string(),
            }),
        }
    }

    fn int(self) -> Result<Int<'ctx>> {
        match self {
            Lowered::I(i) => Ok(i),
            _ => Err(Error::Solver {
                message: "expected an integer term".to_string(),
            }),
        }
    }

    fn bv(self) -> Result<BV<'ctx>> {
        match self {
            Lowered::V(v) => Ok(v),
            _ => Err(Error::Solver {
                message: "expected a bit-vector term".to_string(),
            }),
        }
    }
}

impl Z3Backend {
    pub fn new() -> Self {
        Z3Backend
    }

    fn lower<'ctx>(ctx: &'ctx Context, term: &Term) -> Result<Lowered<'ctx>> {
        Ok(match term {
            Term::BoolLit(v) => Lowered::B(Bool::from_bool(ctx, *v)),
            Term::IntLit(v) => Lowered::I(Int::from_i64(ctx, *v)),
            Term::BvLit(v) => Lowered::V(BV::from_i64(ctx, *v as i64, 32)),
            Term::Const { name, sort } => match sort {
                super::Sort::Bool => Lowered::B(Bool::new_const(ctx, name.as_str())),
                super::Sort::Int => Lowered::I(Int::new_const(ctx, name.as_str())),
                super::Sort::Bv32 => Lowered::V(BV::new_const(ctx, name.as_str(), 32)),
            },

            Term::Not(a) => Lowered::B(Self::lower(ctx, a)?.boolean()?.not()),
            Term::And(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?.boolean()?, Self::lower(ctx, b)?.boolean()?);
                Lowered::B(Bool::and(ctx, &[&a, &b]))
            }
            Term::Or(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?.boolean()?, Self::lower(ctx, b)?.boolean()?);
                Lowered::B(Bool::or(ctx, &[&a, &b]))
            }

            Term::Eq(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?, Self::lower(ctx, b)?);
                match (a, b) {
                    (Lowered::B(a), Lowered::B(b)) => Lowered::B(a._eq(&b)),
                    (Lowered::I(a), Lowered::I(b)) => Lowered::B(a._eq(&b)),
                    (Lowered::V(a), Lowered::V(b)) => Lowered::B(a._eq(&b)),
                    _ => {
                        return Err(Error::Solver {
                            message: "equality over mismatched sorts".to_string(),
                        })
                    }
                }
            }

            Term::Lt(a, b) => {
                Lowered::B(Self::lower(ctx, a)?.int()?.lt(&Self::lower(ctx, b)?.int()?))
            }
            Term::Le(a, b) => {
                Lowered::B(Self::lower(ctx, a)?.int()?.le(&Self::lower(ctx, b)?.int()?))
            }
            Term::Gt(a, b) => {
                Lowered::B(Self::lower(ctx, a)?.int()?.gt(&Self::lower(ctx, b)?.int()?))
            }
            Term::Ge(a, b) => {
                Lowered::B(Self::lower(ctx, a)?.int()?.ge(&Self::lower(ctx, b)?.int()?))
            }

            Term::Neg(a) => Lowered::I(Self::lower(ctx, a)?.int()?.unary_minus()),
            Term::Add(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?.int()?, Self::lower(ctx, b)?.int()?);
                Lowered::I(Int::add(ctx, &[&a, &b]))
            }
            Term::Sub(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?.int()?, Self::lower(ctx, b)?.int()?);
                Lowered::I(Int::sub(ctx, &[&a, &b]))
            }
            Term::Mul(a, b) => {
                let (a, b) = (Self::lower(ctx, a)?.int()?, Self::lower(ctx, b)?.int()?);
                Lowered::I(Int::mul(ctx, &[&a, &b]))
            }

            Term::BvNot(a) => Lowered::V(Self::lower(ctx, a)?.bv()?.bvnot()),
            Term::BvAnd(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvand(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvOr(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvor(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvXor(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvxor(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvShl(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvshl(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvAshr(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvashr(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvLshr(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvlshr(&Self::lower(ctx, b)?.bv()?))
            }
            Term::BvUrem(a, b) => {
                Lowered::V(Self::lower(ctx, a)?.bv()?.bvurem(&Self::lower(ctx, b)?.bv()?))
            }

            Term::BvToInt(a) => Lowered::I(Self::lower(ctx, a)?.bv()?.to_int(true)),
            Term::IntToBv(a) => Lowered::V(BV::from_int(&Self::lower(ctx, a)?.int()?, 32)),
        })
    }
}

impl SolverBackend for Z3Backend {
    fn name(&self) -> &'static str {
        "z3"
    }

    fn check(&mut self, assertions: &[Term]) -> Result<Sat> {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let solver = Solver::new(&ctx);

        for term in assertions {
            solver.assert(&Self::lower(&ctx, term)?.boolean()?);
        }

        Ok(match solver.check() {
            SatResult::Sat => Sat::Sat,
            SatResult::Unsat => Sat::Unsat,
            SatResult::Unknown => Sat::Unknown,
        })
    }
}
