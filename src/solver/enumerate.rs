//! Bounded finite-domain satisfiability by exhaustive enumeration.
//!
//! Free constants are assigned values from a candidate domain. A constant
//! pinned by the assertions themselves (an equality against a literal,
//! intersected across conjunctions and unioned across disjunctions) gets
//! exactly its pinned set; anything else gets a heuristic domain built
//! from the literals in the query. A satisfying assignment proves `Sat`.
//! An exhausted search proves `Unsat` only when every non-boolean
//! constant was pinned, so the domain provably covered all candidates;
//! exhausting a heuristic domain proves nothing and yields `Unknown`, as
//! does a search space over the assignment budget.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

use super::{Sat, SolverBackend, Sort, Term};

const MAX_ASSIGNMENTS: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    B(bool),
    I(i64),
    V(i32),
}

#[derive(Debug, Default)]
pub struct EnumerationBackend;

impl EnumerationBackend {
    pub fn new() -> Self {
        EnumerationBackend
    }

    /// Candidate integer values: around zero, every literal in the query,
    /// and each literal's neighbours so strict/non-strict boundaries are
    /// both represented.
    fn int_domain(assertions: &[Term]) -> Vec<i64> {
        let mut literals = Vec::new();
        for term in assertions {
            term.collect_int_literals(&mut literals);
        }
        let mut domain = vec![-1, 0, 1];
        for lit in literals {
            for v in [lit - 1, lit, lit + 1] {
                if !domain.contains(&v) {
                    domain.push(v);
                }
            }
        }
        domain.sort_unstable();
        domain
    }

    /// Constants a term confines to a finite literal set whenever it
    /// holds. Conjunction intersects the sides, disjunction keeps only
    /// constants both sides pin.
    fn implied_pins(term: &Term) -> BTreeMap<String, BTreeSet<i64>> {
        match term {
            Term::Eq(a, b) => match (a.as_ref(), b.as_ref()) {
                (Term::Const { name, .. }, Term::IntLit(v))
                | (Term::IntLit(v), Term::Const { name, .. }) => {
                    BTreeMap::from([(name.clone(), BTreeSet::from([*v]))])
                }
                (Term::Const { name, .. }, Term::BvLit(v))
                | (Term::BvLit(v), Term::Const { name, .. }) => {
                    BTreeMap::from([(name.clone(), BTreeSet::from([*v as i64]))])
                }
                _ => BTreeMap::new(),
            },
            Term::And(a, b) => {
                let mut pins = Self::implied_pins(a);
                for (name, values) in Self::implied_pins(b) {
                    pins.entry(name)
                        .and_modify(|held| {
                            *held = held.intersection(&values).copied().collect()
                        })
                        .or_insert(values);
                }
                pins
            }
            Term::Or(a, b) => {
                let left = Self::implied_pins(a);
                let right = Self::implied_pins(b);
                left.into_iter()
                    .filter_map(|(name, mut values)| {
                        right.get(&name).map(|other| {
                            values.extend(other.iter().copied());
                            (name, values)
                        })
                    })
                    .collect()
            }
            _ => BTreeMap::new(),
        }
    }

    fn eval(term: &Term, env: &BTreeMap<String, Value>) -> Result<Value> {
        let b = |v: Value| -> Result<bool> {
            match v {
                Value::B(b) => Ok(b),
                _ => Err(Error::Solver {
                    message: "expected a boolean term".to_string(),
                }),
            }
        };
        let i = |v: Value| -> Result<i64> {
            match v {
                Value::I(i) => Ok(i),
                _ => Err(Error::Solver {
                    message: "expected an integer term".to_string(),
                }),
            }
        };
        let bv = |v: Value| -> Result<i32> {
            match v {
                Value::V(x) => Ok(x),
                _ => Err(Error::Solver {
                    message: "expected a bit-vector term".to_string(),
                }),
            }
        };

        Ok(match term {
            Term::BoolLit(v) => Value::B(*v),
            Term::IntLit(v) => Value::I(*v),
            Term::BvLit(v) => Value::V(*v),
            Term::Const { name, .. } => *env.get(name).ok_or_else(|| Error::Solver {
                message: format!("unbound constant `{name}` during enumeration"),
            })?,

            Term::Not(a) => Value::B(!b(Self::eval(a, env)?)?),
            Term::And(a, c) => Value::B(b(Self::eval(a, env)?)? && b(Self::eval(c, env)?)?),
            Term::Or(a, c) => Value::B(b(Self::eval(a, env)?)? || b(Self::eval(c, env)?)?),

            Term::Eq(a, c) => Value::B(Self::eval(a, env)? == Self::eval(c, env)?),
            Term::Lt(a, c) => Value::B(i(Self::eval(a, env)?)? < i(Self::eval(c, env)?)?),
            Term::Le(a, c) => Value::B(i(Self::eval(a, env)?)? <= i(Self::eval(c, env)?)?),
            Term::Gt(a, c) => Value::B(i(Self::eval(a, env)?)? > i(Self::eval(c, env)?)?),
            Term::Ge(a, c) => Value::B(i(Self::eval(a, env)?)? >= i(Self::eval(c, env)?)?),

            Term::Neg(a) => Value::I(-i(Self::eval(a, env)?)?),
            Term::Add(a, c) => Value::I(i(Self::eval(a, env)?)?.wrapping_add(i(Self::eval(c, env)?)?)),
            Term::Sub(a, c) => Value::I(i(Self::eval(a, env)?)?.wrapping_sub(i(Self::eval(c, env)?)?)),
            Term::Mul(a, c) => Value::I(i(Self::eval(a, env)?)?.wrapping_mul(i(Self::eval(c, env)?)?)),

            Term::BvNot(a) => Value::V(!bv(Self::eval(a, env)?)?),
            Term::BvAnd(a, c) => Value::V(bv(Self::eval(a, env)?)? & bv(Self::eval(c, env)?)?),
            Term::BvOr(a, c) => Value::V(bv(Self::eval(a, env)?)? | bv(Self::eval(c, env)?)?),
            Term::BvXor(a, c) => Value::V(bv(Self::eval(a, env)?)? ^ bv(Self::eval(c, env)?)?),
            Term::BvShl(a, c) => {
                let amount = (bv(Self::eval(c, env)?)? as u32) % 32;
                Value::V(bv(Self::eval(a, env)?)?.wrapping_shl(amount))
            }
            Term::BvAshr(a, c) => {
                let amount = (bv(Self::eval(c, env)?)? as u32) % 32;
                Value::V(bv(Self::eval(a, env)?)?.wrapping_shr(amount))
            }
            Term::BvLshr(a, c) => {
                let amount = (bv(Self::eval(c, env)?)? as u32) % 32;
                Value::V(((bv(Self::eval(a, env)?)? as u32).wrapping_shr(amount)) as i32)
            }
            Term::BvUrem(a, c) => {
                let rhs = bv(Self::eval(c, env)?)? as u32;
                if rhs == 0 {
                    return Err(Error::Solver {
                        message: "bit-vector remainder by zero".to_string(),
                    });
                }
                Value::V(((bv(Self::eval(a, env)?)? as u32) % rhs) as i32)
            }

            Term::BvToInt(a) => Value::I(bv(Self::eval(a, env)?)? as i64),
            Term::IntToBv(a) => Value::V(i(Self::eval(a, env)?)? as i32),
        })
    }
}

impl SolverBackend for EnumerationBackend {
    fn name(&self) -> &'static str {
        "enum"
    }

    fn check(&mut self, assertions: &[Term]) -> Result<Sat> {
        let mut consts = BTreeMap::new();
        for term in assertions {
            if term.sort() != Sort::Bool {
                return Err(Error::Solver {
                    message: "assertion is not boolean-sorted".to_string(),
                });
            }
            term.collect_consts(&mut consts);
        }

        let mut pins: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        for term in assertions {
            for (name, values) in Self::implied_pins(term) {
                pins.entry(name)
                    .and_modify(|held| *held = held.intersection(&values).copied().collect())
                    .or_insert(values);
            }
        }

        let int_domain = Self::int_domain(assertions);
        let mut exhaustive = true;
        let mut domains: Vec<(&String, Vec<Value>)> = Vec::new();
        for (name, sort) in &consts {
            let values = match sort {
                Sort::Bool => vec![Value::B(false), Value::B(true)],
                Sort::Int => match pins.get(name) {
                    Some(set) => set.iter().map(|v| Value::I(*v)).collect(),
                    None => {
                        exhaustive = false;
                        int_domain.iter().map(|v| Value::I(*v)).collect()
                    }
                },
                Sort::Bv32 => match pins.get(name) {
                    Some(set) => set.iter().map(|v| Value::V(*v as i32)).collect(),
                    None => {
                        exhaustive = false;
                        int_domain.iter().map(|v| Value::V(*v as i32)).collect()
                    }
                },
            };
            if values.is_empty() {
                // Contradictory pins leave no candidate at all.
                return Ok(Sat::Unsat);
            }
            domains.push((name, values));
        }
        let exhausted = if exhaustive { Sat::Unsat } else { Sat::Unknown };

        let mut space: u64 = 1;
        for (_, values) in &domains {
            space = space.saturating_mul(values.len() as u64);
            if space > MAX_ASSIGNMENTS {
                return Ok(Sat::Unknown);
            }
        }

        // Mixed-radix counter over the candidate domains.
        let mut indices = vec![0usize; domains.len()];
        loop {
            let mut env = BTreeMap::new();
            for (slot, (name, values)) in domains.iter().enumerate() {
                env.insert((*name).clone(), values[indices[slot]]);
            }

            let mut all_true = true;
            for term in assertions {
                match Self::eval(term, &env)? {
                    Value::B(true) => {}
                    Value::B(false) => {
                        all_true = false;
                        break;
                    }
                    _ => {
                        return Err(Error::Solver {
                            message: "assertion evaluated to a non-boolean".to_string(),
                        })
                    }
                }
            }
            if all_true {
                return Ok(Sat::Sat);
            }

            // Advance the counter; done when it wraps.
            let mut slot = 0;
            loop {
                if slot == domains.len() {
                    return Ok(exhausted);
                }
                indices[slot] += 1;
                if indices[slot] < domains[slot].1.len() {
                    break;
                }
                indices[slot] = 0;
                slot += 1;
            }
        }
    }
}
