//! ABOUTME: Bare-expression and `{{ }}` template resolver for the autoflow workflow engine
//! ABOUTME: Evaluates `condition`, `items`, `expression`, and `key` step fields against a `Scope`

mod ast;
mod eval;
mod filters;
mod lexer;
mod parser;
mod template;

pub use ast::{BinaryOp, Expr, UnaryOp};

use autoflow_core::{Scope, Value};
use thiserror::Error;

/// Failure parsing or evaluating a bare expression or template segment.
///
/// Carries only the offending source text and message; the engine wraps
/// this into `autoflow_core::Error::Expression` with the step id attached.
#[derive(Debug, Error)]
#[error("{message} (in `{source_text}`)")]
pub struct EvalError {
    pub source_text: String,
    pub message: String,
}

impl EvalError {
    fn new(source_text: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            message: message.into(),
        }
    }
}

/// Parses a bare expression without evaluating it. Used to validate a
/// document at compile time before any step runs.
pub fn parse_expression(source: &str) -> Result<Expr, EvalError> {
    parser::parse(source).map_err(|e| EvalError::new(source, e))
}

/// Parses and evaluates a bare expression (a `condition`, `items`,
/// `expression`, or `key` field) against `scope`.
pub fn evaluate(source: &str, scope: &Scope) -> Result<Value, EvalError> {
    let expr = parse_expression(source)?;
    eval::eval(&expr, scope).map_err(|e| EvalError::new(source, e))
}

/// Evaluates `source` and coerces the result through [`Value::is_truthy`].
/// Used by `if`/`while`/`try` condition fields.
pub fn evaluate_condition(source: &str, scope: &Scope) -> Result<bool, EvalError> {
    evaluate(source, scope).map(|v| v.is_truthy())
}

/// Resolves one action-input value. A string that is *entirely* a single
/// `{{ expr }}` segment evaluates as a bare expression, preserving the
/// result's type (number, list, map, ...). Anything else — literal text, or
/// text mixed with `{{ }}` segments — renders as a template string.
pub fn resolve_input_value(source: &str, scope: &Scope) -> Result<Value, EvalError> {
    let trimmed = source.trim();
    if let Some(inner) = whole_segment(trimmed) {
        return evaluate(inner, scope);
    }
    render_template(source, scope).map(Value::String)
}

fn whole_segment(trimmed: &str) -> Option<&str> {
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("}}") {
        None
    } else {
        Some(inner)
    }
}

/// Expands every `{{ expression }}` segment in `source` against `scope`,
/// stringifying results via [`Value::to_template_string`]. Text outside
/// `{{ }}` passes through unchanged.
pub fn render_template(source: &str, scope: &Scope) -> Result<String, EvalError> {
    template::render(source, scope).map_err(|e| EvalError::new(source, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_condition_on_missing_variable_is_false() {
        let scope = Scope::new();
        assert!(!evaluate_condition("missing.field", &scope).unwrap());
    }

    #[test]
    fn evaluate_condition_reports_source_text_on_parse_failure() {
        let scope = Scope::new();
        let err = evaluate_condition("a ===", &scope).unwrap_err();
        assert_eq!(err.source_text, "a ===");
    }

    #[test]
    fn resolve_input_value_preserves_type_for_whole_segment() {
        let mut scope = Scope::new();
        scope.bind_at_root("count", Value::Number(5.0));
        assert_eq!(
            resolve_input_value("{{ count }}", &scope).unwrap(),
            Value::Number(5.0)
        );
    }

    #[test]
    fn resolve_input_value_stringifies_mixed_text() {
        let mut scope = Scope::new();
        scope.bind_at_root("count", Value::Number(5.0));
        assert_eq!(
            resolve_input_value("count is {{ count }}", &scope).unwrap(),
            Value::string("count is 5")
        );
    }

    #[test]
    fn render_template_roundtrips_plain_values() {
        let mut scope = Scope::new();
        scope.bind_at_root("status", Value::string("ok"));
        assert_eq!(
            render_template("status: {{ status }}", &scope).unwrap(),
            "status: ok"
        );
    }
}
