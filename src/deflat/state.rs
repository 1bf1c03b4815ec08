//! Symbolic values and per-block variable state.
//!
//! The walker folds dispatcher bookkeeping into a [`FlatState`], a map from
//! variable names to [`FlatValue`]s. Evaluation distinguishes three
//! outcomes: a confident value, "unconfident" (the expression is legal but
//! its value depends on inputs we do not track), and a hard error for
//! constructs the evaluator does not model.

use std::collections::BTreeMap;

use oxc_ast::ast::{BinaryOperator, Expression, LogicalOperator, UnaryOperator};

use crate::error::{Error, Result};

/// A primitive JS value the symbolic executor can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatValue {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl FlatValue {
    /// JS truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            FlatValue::Undefined | FlatValue::Null => false,
            FlatValue::Bool(b) => *b,
            FlatValue::Num(n) => *n != 0.0 && !n.is_nan(),
            FlatValue::Str(s) => !s.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            FlatValue::Undefined => "undefined",
            FlatValue::Null => "null",
            FlatValue::Bool(_) => "boolean",
            FlatValue::Num(_) => "number",
            FlatValue::Str(_) => "string",
        }
    }
}

/// Variable environment carried along a path through the dispatcher.
pub type FlatState = BTreeMap<String, FlatValue>;

/// ECMA ToInt32.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let modulus = 4294967296.0;
    let t = n.trunc();
    let m = ((t % modulus) + modulus) % modulus;
    if m >= 2147483648.0 {
        (m - modulus) as i32
    } else {
        m as i32
    }
}

/// ECMA ToUint32, used for shift counts.
pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// JS `===` over two confident values.
pub fn strict_values_equal(left: &FlatValue, right: &FlatValue) -> bool {
    strict_eq(left, right)
}

fn strict_eq(left: &FlatValue, right: &FlatValue) -> bool {
    // PartialEq on f64 gives NaN !== NaN, which matches JS here.
    match (left, right) {
        (FlatValue::Undefined, FlatValue::Undefined) => true,
        (FlatValue::Null, FlatValue::Null) => true,
        (FlatValue::Bool(a), FlatValue::Bool(b)) => a == b,
        (FlatValue::Num(a), FlatValue::Num(b)) => a == b,
        (FlatValue::Str(a), FlatValue::Str(b)) => a == b,
        _ => false,
    }
}

fn loose_eq(left: &FlatValue, right: &FlatValue) -> Result<bool> {
    match (left, right) {
        (FlatValue::Undefined | FlatValue::Null, FlatValue::Undefined | FlatValue::Null) => {
            Ok(true)
        }
        _ if left.type_name() == right.type_name() => Ok(strict_eq(left, right)),
        _ => Err(Error::unsupported(format!(
            "loose equality between {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn numeric_pair(left: &FlatValue, right: &FlatValue, op: &str) -> Result<(f64, f64)> {
    match (left, right) {
        (FlatValue::Num(a), FlatValue::Num(b)) => Ok((*a, *b)),
        _ => Err(Error::unsupported(format!(
            "operator `{op}` on {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn apply_binary(op: BinaryOperator, left: &FlatValue, right: &FlatValue) -> Result<FlatValue> {
    Ok(match op {
        BinaryOperator::StrictEquality => FlatValue::Bool(strict_eq(left, right)),
        BinaryOperator::StrictInequality => FlatValue::Bool(!strict_eq(left, right)),
        BinaryOperator::Equality => FlatValue::Bool(loose_eq(left, right)?),
        BinaryOperator::Inequality => FlatValue::Bool(!loose_eq(left, right)?),

        BinaryOperator::LessThan => {
            let (a, b) = numeric_pair(left, right, "<")?;
            FlatValue::Bool(a < b)
        }
        BinaryOperator::LessEqualThan => {
            let (a, b) = numeric_pair(left, right, "<=")?;
            FlatValue::Bool(a <= b)
        }
        BinaryOperator::GreaterThan => {
            let (a, b) = numeric_pair(left, right, ">")?;
            FlatValue::Bool(a > b)
        }
        BinaryOperator::GreaterEqualThan => {
            let (a, b) = numeric_pair(left, right, ">=")?;
            FlatValue::Bool(a >= b)
        }

        BinaryOperator::Addition => match (left, right) {
            (FlatValue::Num(a), FlatValue::Num(b)) => FlatValue::Num(a + b),
            (FlatValue::Str(a), FlatValue::Str(b)) => FlatValue::Str(format!("{a}{b}")),
            _ => {
                return Err(Error::unsupported(format!(
                    "operator `+` on {} and {}",
                    left.type_name(),
                    right.type_name()
                )))
            }
        },
        BinaryOperator::Subtraction => {
            let (a, b) = numeric_pair(left, right, "-")?;
            FlatValue::Num(a - b)
        }
        BinaryOperator::Multiplication => {
            let (a, b) = numeric_pair(left, right, "*")?;
            FlatValue::Num(a * b)
        }
        BinaryOperator::Division => {
            let (a, b) = numeric_pair(left, right, "/")?;
            FlatValue::Num(a / b)
        }
        BinaryOperator::Remainder => {
            let (a, b) = numeric_pair(left, right, "%")?;
            FlatValue::Num(a % b)
        }
        BinaryOperator::Exponential => {
            let (a, b) = numeric_pair(left, right, "**")?;
            FlatValue::Num(a.powf(b))
        }

        BinaryOperator::BitwiseAnd => {
            let (a, b) = numeric_pair(left, right, "&")?;
            FlatValue::Num((to_int32(a) & to_int32(b)) as f64)
        }
        BinaryOperator::BitwiseOR => {
            let (a, b) = numeric_pair(left, right, "|")?;
            FlatValue::Num((to_int32(a) | to_int32(b)) as f64)
        }
        BinaryOperator::BitwiseXOR => {
            let (a, b) = numeric_pair(left, right, "^")?;
            FlatValue::Num((to_int32(a) ^ to_int32(b)) as f64)
        }
        BinaryOperator::ShiftLeft => {
            let (a, b) = numeric_pair(left, right, "<<")?;
            FlatValue::Num(to_int32(a).wrapping_shl(to_uint32(b) % 32) as f64)
        }
        BinaryOperator::ShiftRight => {
            let (a, b) = numeric_pair(left, right, ">>")?;
            FlatValue::Num(to_int32(a).wrapping_shr(to_uint32(b) % 32) as f64)
        }
        BinaryOperator::ShiftRightZeroFill => {
            let (a, b) = numeric_pair(left, right, ">>>")?;
            FlatValue::Num((to_uint32(a).wrapping_shr(to_uint32(b) % 32)) as f64)
        }

        BinaryOperator::In | BinaryOperator::Instanceof => {
            return Err(Error::unsupported(format!(
                "operator `{}` on confident operands",
                op.as_str()
            )))
        }
    })
}

/// Evaluate `expr` against `state`. `Ok(None)` means the expression is
/// legal but its value is not known confidently.
pub fn try_evaluate(expr: &Expression<'_>, state: &FlatState) -> Result<Option<FlatValue>> {
    Ok(match expr {
        Expression::NumericLiteral(lit) => Some(FlatValue::Num(lit.value)),
        Expression::StringLiteral(lit) => Some(FlatValue::Str(lit.value.to_string())),
        Expression::BooleanLiteral(lit) => Some(FlatValue::Bool(lit.value)),
        Expression::NullLiteral(_) => Some(FlatValue::Null),

        Expression::Identifier(ident) => match ident.name.as_str() {
            "undefined" => Some(FlatValue::Undefined),
            "NaN" => Some(FlatValue::Num(f64::NAN)),
            "Infinity" => Some(FlatValue::Num(f64::INFINITY)),
            name => state.get(name).cloned(),
        },

        Expression::ParenthesizedExpression(inner) => try_evaluate(&inner.expression, state)?,

        Expression::UnaryExpression(unary) => {
            let arg = try_evaluate(&unary.argument, state)?;
            match unary.operator {
                UnaryOperator::Void => Some(FlatValue::Undefined),
                UnaryOperator::LogicalNot => arg.map(|v| FlatValue::Bool(!v.is_truthy())),
                UnaryOperator::UnaryNegation => match arg {
                    Some(FlatValue::Num(n)) => Some(FlatValue::Num(-n)),
                    Some(v) => {
                        return Err(Error::unsupported(format!(
                            "unary `-` on {}",
                            v.type_name()
                        )))
                    }
                    None => None,
                },
                UnaryOperator::UnaryPlus => match arg {
                    Some(FlatValue::Num(n)) => Some(FlatValue::Num(n)),
                    Some(v) => {
                        return Err(Error::unsupported(format!(
                            "unary `+` on {}",
                            v.type_name()
                        )))
                    }
                    None => None,
                },
                UnaryOperator::BitwiseNot => match arg {
                    Some(FlatValue::Num(n)) => Some(FlatValue::Num(!to_int32(n) as f64)),
                    Some(v) => {
                        return Err(Error::unsupported(format!(
                            "unary `~` on {}",
                            v.type_name()
                        )))
                    }
                    None => None,
                },
                // typeof/delete results depend on bindings we do not track
                UnaryOperator::Typeof | UnaryOperator::Delete => None,
            }
        }

        Expression::BinaryExpression(binary) => {
            let left = try_evaluate(&binary.left, state)?;
            let right = try_evaluate(&binary.right, state)?;
            match (left, right) {
                (Some(l), Some(r)) => Some(apply_binary(binary.operator, &l, &r)?),
                _ => None,
            }
        }

        Expression::LogicalExpression(logical) => {
            let left = try_evaluate(&logical.left, state)?;
            match (logical.operator, left) {
                (_, None) => None,
                (LogicalOperator::And, Some(l)) if !l.is_truthy() => Some(l),
                (LogicalOperator::Or, Some(l)) if l.is_truthy() => Some(l),
                (LogicalOperator::Coalesce, Some(l))
                    if !matches!(l, FlatValue::Undefined | FlatValue::Null) =>
                {
                    Some(l)
                }
                (_, Some(_)) => try_evaluate(&logical.right, state)?,
            }
        }

        Expression::ConditionalExpression(cond) => match try_evaluate(&cond.test, state)? {
            Some(test) if test.is_truthy() => try_evaluate(&cond.consequent, state)?,
            Some(_) => try_evaluate(&cond.alternate, state)?,
            None => None,
        },

        Expression::SequenceExpression(seq) => {
            let mut last = None;
            for sub in &seq.expressions {
                last = try_evaluate(sub, state)?;
            }
            last
        }

        Expression::ComputedMemberExpression(member) => {
            match try_evaluate(&member.object, state)? {
                None => None,
                Some(v) => {
                    return Err(Error::unsupported(format!(
                        "member access on confident {}",
                        v.type_name()
                    )))
                }
            }
        }
        Expression::StaticMemberExpression(member) => {
            match try_evaluate(&member.object, state)? {
                None => None,
                Some(v) => {
                    return Err(Error::unsupported(format!(
                        "member access on confident {}",
                        v.type_name()
                    )))
                }
            }
        }

        // Legal but state-opaque expression families.
        Expression::AssignmentExpression(_)
        | Expression::UpdateExpression(_)
        | Expression::CallExpression(_)
        | Expression::NewExpression(_)
        | Expression::ObjectExpression(_)
        | Expression::ArrayExpression(_)
        | Expression::FunctionExpression(_)
        | Expression::ArrowFunctionExpression(_)
        | Expression::TemplateLiteral(_)
        | Expression::TaggedTemplateExpression(_)
        | Expression::RegExpLiteral(_)
        | Expression::ThisExpression(_)
        | Expression::ChainExpression(_) => None,

        other => {
            return Err(Error::unhandled(
                "evaluate",
                format!("expression kind {:?}", std::mem::discriminant(other)),
            ))
        }
    })
}

/// Evaluate and require a confident result.
pub fn expect_evaluate(expr: &Expression<'_>, state: &FlatState) -> Result<FlatValue> {
    try_evaluate(expr, state)?.ok_or_else(|| {
        Error::unhandled("evaluate", "expected a confident value".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn eval(source: &str, state: &FlatState) -> Result<Option<FlatValue>> {
        let allocator = Allocator::default();
        // Leading `;` keeps a bare string-literal fixture out of the
        // directive prologue so it parses as an expression statement.
        let source = format!(";{source}");
        let ret = Parser::new(&allocator, &source, SourceType::cjs()).parse();
        assert!(ret.errors.is_empty(), "fixture must parse: {source}");
        let stmt = &ret.program.body[1];
        let expr = match stmt {
            oxc_ast::ast::Statement::ExpressionStatement(es) => &es.expression,
            _ => panic!("fixture must be an expression statement"),
        };
        try_evaluate(expr, state)
    }

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(4294967296.0), 0);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(3.9), 3);
        assert_eq!(to_int32(-3.9), -3);
    }

    #[test]
    fn test_literals_and_void() {
        let state = FlatState::new();
        assert_eq!(eval("42", &state).unwrap(), Some(FlatValue::Num(42.0)));
        assert_eq!(
            eval("void 0", &state).unwrap(),
            Some(FlatValue::Undefined)
        );
        assert_eq!(
            eval("'abc'", &state).unwrap(),
            Some(FlatValue::Str("abc".to_string()))
        );
        assert_eq!(eval("null", &state).unwrap(), Some(FlatValue::Null));
    }

    #[test]
    fn test_identifier_lookup() {
        let mut state = FlatState::new();
        state.insert("k".to_string(), FlatValue::Num(7.0));
        assert_eq!(eval("k", &state).unwrap(), Some(FlatValue::Num(7.0)));
        assert_eq!(eval("unknown_var", &state).unwrap(), None);
    }

    #[test]
    fn test_dispatcher_test_expression() {
        let mut state = FlatState::new();
        state.insert("k".to_string(), FlatValue::Num(3.0));
        assert_eq!(
            eval("void 0 !== k", &state).unwrap(),
            Some(FlatValue::Bool(true))
        );
        state.insert("k".to_string(), FlatValue::Undefined);
        assert_eq!(
            eval("void 0 !== k", &state).unwrap(),
            Some(FlatValue::Bool(false))
        );
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let mut state = FlatState::new();
        state.insert("a".to_string(), FlatValue::Num(4.0));
        assert_eq!(
            eval("a * 2 + 1", &state).unwrap(),
            Some(FlatValue::Num(9.0))
        );
        assert_eq!(
            eval("a < 10", &state).unwrap(),
            Some(FlatValue::Bool(true))
        );
    }

    #[test]
    fn test_bitwise_uses_int32() {
        let mut state = FlatState::new();
        state.insert("x".to_string(), FlatValue::Num(4294967296.0 + 5.0));
        assert_eq!(eval("x | 0", &state).unwrap(), Some(FlatValue::Num(5.0)));
        assert_eq!(eval("-1 >>> 0", &state).unwrap(), Some(FlatValue::Num(4294967295.0)));
    }

    #[test]
    fn test_unconfident_propagates() {
        let state = FlatState::new();
        assert_eq!(eval("u + 1", &state).unwrap(), None);
        assert_eq!(eval("fn()", &state).unwrap(), None);
        assert_eq!(eval("obj.prop", &state).unwrap(), None);
    }

    #[test]
    fn test_mixed_type_loose_equality_rejected() {
        let mut state = FlatState::new();
        state.insert("a".to_string(), FlatValue::Num(1.0));
        state.insert("b".to_string(), FlatValue::Str("1".to_string()));
        assert!(eval("a == b", &state).is_err());
        // strict comparison across types is just false
        assert_eq!(
            eval("a === b", &state).unwrap(),
            Some(FlatValue::Bool(false))
        );
    }

    #[test]
    fn test_logical_short_circuit() {
        let mut state = FlatState::new();
        state.insert("f".to_string(), FlatValue::Bool(false));
        // right side never evaluated, unknown identifier does not matter
        assert_eq!(
            eval("f && mystery", &state).unwrap(),
            Some(FlatValue::Bool(false))
        );
        assert_eq!(eval("f || mystery", &state).unwrap(), None);
    }
}
