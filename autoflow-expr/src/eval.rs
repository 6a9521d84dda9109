//! ABOUTME: Evaluates a parsed expression against a variable scope, producing a `Value`
//! ABOUTME: Arithmetic/comparison on undefined or null operands propagates `Undefined` rather than erroring

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::filters;
use autoflow_core::{Scope, Value};

pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value, String> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Identifier(name) => Ok(scope.lookup(name)),
        Expr::Field(base, name) => Ok(eval(base, scope)?.get_key(name)),
        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            Ok(match index {
                Value::Number(n) if n >= 0.0 => base.get_index(n as usize),
                Value::String(key) => base.get_key(&key),
                _ => Value::Undefined,
            })
        }
        Expr::Unary(op, operand) => eval_unary(op, eval(operand, scope)?),
        Expr::Binary(op, left, right) => eval_binary(op, left, right, scope),
        Expr::Filter(base, name, args) => {
            let input = eval(base, scope)?;
            let args = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            filters::apply(name, input, args)
        }
    }
}

fn eval_unary(op: &UnaryOp, value: Value) -> Result<Value, String> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value {
            Value::Number(n) => Ok(Value::Number(-n)),
            Value::Null | Value::Undefined => Ok(Value::Undefined),
            other => Err(format!("cannot negate a {}", other.type_name())),
        },
    }
}

fn eval_binary(op: &BinaryOp, left: &Expr, right: &Expr, scope: &Scope) -> Result<Value, String> {
    // `and`/`or` short-circuit on truthiness before evaluating the right side.
    match op {
        BinaryOp::And => {
            let left = eval(left, scope)?;
            if !left.is_truthy() {
                return Ok(Value::Bool(false));
            }
            return Ok(Value::Bool(eval(right, scope)?.is_truthy()));
        }
        BinaryOp::Or => {
            let left = eval(left, scope)?;
            if left.is_truthy() {
                return Ok(Value::Bool(true));
            }
            return Ok(Value::Bool(eval(right, scope)?.is_truthy()));
        }
        _ => {}
    }

    let left = eval(left, scope)?;
    let right = eval(right, scope)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Ok(Value::Bool(compare(op, &left, &right)))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn compare(op: &BinaryOp, left: &Value, right: &Value) -> bool {
    if left.is_null_or_undefined() || right.is_null_or_undefined() {
        return false;
    }
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    }
}

fn arithmetic(op: &BinaryOp, left: Value, right: Value) -> Result<Value, String> {
    if left.is_null_or_undefined() || right.is_null_or_undefined() {
        return Ok(Value::Undefined);
    }

    if let (Value::String(a), Value::String(b)) = (&left, &right) {
        return match op {
            BinaryOp::Add => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(format!(
                "cannot apply '{op:?}' to two strings; only '+' concatenates"
            )),
        };
    }

    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match op {
            BinaryOp::Add => Ok(Value::Number(a + b)),
            BinaryOp::Sub => Ok(Value::Number(a - b)),
            BinaryOp::Mul => Ok(Value::Number(a * b)),
            BinaryOp::Div => {
                if b == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(Value::Number(a / b))
                }
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(Value::Number(a % b))
                }
            }
            _ => unreachable!("comparison/logical ops handled earlier"),
        },
        (a, b) => Err(format!(
            "cannot apply '{op:?}' to {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn eval_str(src: &str, scope: &Scope) -> Value {
        eval(&parse(src).unwrap(), scope).unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 + 2 * 3", &scope), Value::Number(7.0));
        assert_eq!(eval_str("(1 + 2) * 3", &scope), Value::Number(9.0));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let scope = Scope::new();
        let result = eval(&parse("1 / 0").unwrap(), &scope);
        assert!(result.is_err());
    }

    #[test]
    fn comparisons_on_undefined_are_false_not_errors() {
        let scope = Scope::new();
        assert_eq!(eval_str("missing > 5", &scope), Value::Bool(false));
    }

    #[test]
    fn dotted_path_and_index_lookup() {
        let mut scope = Scope::new();
        let mut user = indexmap::IndexMap::new();
        user.insert(
            "tags".to_string(),
            Value::List(vec![Value::string("a"), Value::string("b")]),
        );
        scope.bind_at_root("user", Value::Map(user));
        assert_eq!(eval_str("user.tags[1]", &scope), Value::string("b"));
    }

    #[test]
    fn filter_chain_transforms_value() {
        let mut scope = Scope::new();
        scope.bind_at_root("name", Value::string("  deploy report  "));
        assert_eq!(
            eval_str("name | trim | title", &scope),
            Value::string("Deploy Report")
        );
    }

    #[test]
    fn and_or_short_circuit_and_return_bool() {
        let scope = Scope::new();
        assert_eq!(eval_str("1 and 0", &scope), Value::Bool(false));
        assert_eq!(eval_str("0 or 2", &scope), Value::Bool(true));
    }

    use proptest::prelude::*;

    proptest! {
        /// `a OP b` for any two small integers and any of the four
        /// arithmetic operators must agree with evaluating the same sum
        /// directly in Rust — precedence and associativity aside, this
        /// pins down that the grammar never silently swaps an operand.
        #[test]
        fn binary_arithmetic_matches_direct_computation(
            a in -1000i64..1000,
            b in -1000i64..1000,
            op in proptest::sample::select(vec!["+", "-", "*"]),
        ) {
            let scope = Scope::new();
            let src = format!("{a} {op} {b}");
            let got = eval_str(&src, &scope);

            let want = match op {
                "+" => a as f64 + b as f64,
                "-" => a as f64 - b as f64,
                "*" => a as f64 * b as f64,
                _ => unreachable!(),
            };
            prop_assert_eq!(got, Value::Number(want));
        }

        /// A parenthesised sub-expression always evaluates to the same
        /// value as the bare operator chain it wraps — parentheses only
        /// override precedence, never change what gets computed once
        /// grouping is made explicit on both sides.
        #[test]
        fn parentheses_do_not_change_a_fully_grouped_result(
            a in -100i64..100,
            b in -100i64..100,
            c in -100i64..100,
        ) {
            let scope = Scope::new();
            let grouped = eval_str(&format!("({a} + {b}) * {c}"), &scope);
            let direct = Value::Number((a as f64 + b as f64) * c as f64);
            prop_assert_eq!(grouped, direct);
        }
    }
}
