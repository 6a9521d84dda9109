//! ABOUTME: Frontmatter/Markdown splitter and typed Workflow deserialiser
//! ABOUTME: Pure function of the input bytes — no I/O is performed here

use crate::Warning;
use autoflow_core::Error;
use autoflow_engine::model::Workflow;

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["workflow", "tools", "inputs", "triggers", "steps"];

/// A successfully parsed document: the typed workflow, the preserved
/// narrative Markdown body, and any non-fatal warnings collected along
/// the way.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub workflow: Workflow,
    /// Narrative Markdown following the frontmatter fence. Preserved
    /// verbatim for round-trip; never interpreted by the engine.
    pub markdown: String,
    pub warnings: Vec<Warning>,
}

/// Parses a UTF-8 byte stream containing a `---` fenced YAML frontmatter
/// block followed by narrative Markdown.
///
/// # Errors
/// Returns [`Error::InvalidDocument`] when the input is not valid UTF-8 or
/// the frontmatter fence is missing/malformed, and [`Error::InvalidSchema`]
/// when the frontmatter parses as YAML but required workflow fields are
/// missing or mistyped.
pub fn parse(bytes: &[u8]) -> Result<ParsedDocument, Error> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::invalid_document(format!("document is not valid UTF-8: {e}")))?;
    parse_str(text)
}

/// As [`parse`], but operating directly on an already-decoded string.
pub fn parse_str(text: &str) -> Result<ParsedDocument, Error> {
    let (frontmatter, markdown) = split_frontmatter(text)?;

    let raw: serde_yaml::Value = serde_yaml::from_str(frontmatter).map_err(|e| {
        Error::invalid_document(format!("frontmatter is not valid YAML: {e}"))
    })?;

    let mapping = raw.as_mapping().ok_or_else(|| {
        Error::invalid_document("frontmatter must be a YAML mapping at the top level")
    })?;

    let mut warnings = Vec::new();
    for key in mapping.keys() {
        let Some(key) = key.as_str() else { continue };
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key) {
            warnings.push(Warning::UnknownKey {
                key: key.to_string(),
            });
        }
    }

    let workflow: Workflow = serde_yaml::from_value(raw)
        .map_err(|e| Error::invalid_schema(format!("workflow document: {e}")))?;

    workflow.validate()?;
    validate_expressions(&workflow)?;

    Ok(ParsedDocument {
        workflow,
        markdown: markdown.to_string(),
        warnings,
    })
}

/// Splits `text` at the first `---\n…\n---` fence. The fence markers must
/// each occupy their own line. Everything before the opening fence must be
/// blank (only whitespace); everything after the closing fence is returned
/// verbatim as the Markdown body.
fn split_frontmatter(text: &str) -> Result<(&str, &str), Error> {
    let trimmed_start = text.trim_start_matches(['\n', '\r', ' ', '\t']);

    if !trimmed_start.starts_with("---") {
        return Err(Error::invalid_document(
            "document must begin with a '---' frontmatter fence",
        ));
    }
    let after_open = &trimmed_start[3..];
    let after_open = after_open.strip_prefix('\r').unwrap_or(after_open);
    let after_open = after_open
        .strip_prefix('\n')
        .ok_or_else(|| Error::invalid_document("opening '---' fence must end the line"))?;

    let close_marker = find_closing_fence(after_open)
        .ok_or_else(|| Error::invalid_document("no closing '---' frontmatter fence found"))?;

    let frontmatter = &after_open[..close_marker.fence_start];
    let markdown = after_open[close_marker.body_start..]
        .trim_start_matches(['\n', '\r'])
        .trim_start();

    Ok((frontmatter, markdown))
}

struct CloseMarker {
    fence_start: usize,
    body_start: usize,
}

/// Scans line-by-line for a line consisting of exactly `---` (allowing a
/// trailing `\r`), returning byte offsets into `haystack`.
fn find_closing_fence(haystack: &str) -> Option<CloseMarker> {
    let mut offset = 0usize;
    for line in haystack.split('\n') {
        let stripped = line.strip_suffix('\r').unwrap_or(line);
        if stripped.trim_end() == "---" {
            let body_start = offset + line.len() + 1; // +1 for the '\n' the split consumed
            return Some(CloseMarker {
                fence_start: offset,
                body_start: body_start.min(haystack.len()),
            });
        }
        offset += line.len() + 1;
    }
    None
}

/// Compile-time validation pass: every bare expression (`condition`,
/// `items`, `expression`, `key`) and every action-input template must at
/// least parse, so malformed documents fail before any step runs rather
/// than mid-execution.
fn validate_expressions(workflow: &Workflow) -> Result<(), Error> {
    validate_steps(&workflow.steps)
}

fn validate_steps(steps: &[autoflow_engine::model::Step]) -> Result<(), Error> {
    use autoflow_engine::model::StepKind;

    for step in steps {
        if let Some(cond) = &step.condition {
            check_expression(&step.id, cond)?;
        }
        match &step.kind {
            StepKind::Action { inputs, .. } | StepKind::InvokeWorkflow { inputs, .. } => {
                for value in inputs.values() {
                    check_template(&step.id, value)?;
                }
            }
            StepKind::If { then, r#else } => {
                validate_steps(then)?;
                validate_steps(r#else)?;
            }
            StepKind::Switch {
                expression,
                cases,
                default,
            } => {
                check_expression(&step.id, expression)?;
                for branch in cases.values() {
                    validate_steps(branch)?;
                }
                if let Some(default) = default {
                    validate_steps(default)?;
                }
            }
            StepKind::ForEach { items, steps, .. } => {
                check_expression(&step.id, items)?;
                validate_steps(steps)?;
            }
            StepKind::While {
                condition, steps, ..
            } => {
                check_expression(&step.id, condition)?;
                validate_steps(steps)?;
            }
            StepKind::Map {
                input, expression, ..
            } => {
                check_expression(&step.id, input)?;
                check_expression(&step.id, expression)?;
            }
            StepKind::Filter {
                input, condition, ..
            } => {
                check_expression(&step.id, input)?;
                check_expression(&step.id, condition)?;
            }
            StepKind::Reduce {
                input, expression, ..
            } => {
                check_expression(&step.id, input)?;
                check_expression(&step.id, expression)?;
            }
            StepKind::Parallel { branches } => {
                for branch in branches {
                    validate_steps(&branch.steps)?;
                }
            }
            StepKind::Try {
                r#try,
                catch,
                finally,
            } => {
                validate_steps(r#try)?;
                validate_steps(catch)?;
                validate_steps(finally)?;
            }
        }
    }
    Ok(())
}

fn check_expression(step_id: &str, source: &str) -> Result<(), Error> {
    autoflow_expr::parse_expression(source)
        .map_err(|e| Error::expression(step_id, source, e.message))?;
    Ok(())
}

fn check_template(step_id: &str, source: &str) -> Result<(), Error> {
    // Only whole-segment `{{ expr }}` values are parsed eagerly here;
    // mixed literal/template strings are validated segment-by-segment by
    // the template resolver itself at evaluation time, since splitting
    // requires the same lexer the resolver already owns.
    let trimmed = source.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("}}") {
            return check_expression(step_id, inner);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "---\nworkflow:\n  id: demo\n  name: Demo\nsteps:\n  - id: s1\n    type: action\n    action: core.set\n    inputs:\n      x: \"1\"\n---\n# Demo\n\nSome narrative text.\n";

    #[test]
    fn splits_frontmatter_and_markdown() {
        let doc = parse_str(MINIMAL).unwrap();
        assert_eq!(doc.workflow.workflow.id, "demo");
        assert!(doc.markdown.contains("Some narrative text."));
    }

    #[test]
    fn missing_opening_fence_is_invalid_document() {
        let err = parse_str("workflow:\n  id: x\n").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
    }

    #[test]
    fn missing_closing_fence_is_invalid_document() {
        let err = parse_str("---\nworkflow:\n  id: x\n").unwrap_err();
        assert!(matches!(err, Error::InvalidDocument { .. }));
    }

    #[test]
    fn missing_required_field_is_invalid_schema() {
        let text = "---\nworkflow:\n  name: Demo\nsteps: []\n---\n";
        let err = parse_str(text).unwrap_err();
        assert!(matches!(err, Error::InvalidSchema { .. }));
    }

    #[test]
    fn unknown_top_level_key_is_a_warning_not_an_error() {
        let text = "---\nworkflow:\n  id: demo\n  name: Demo\nsteps: []\nfancy_extra: 1\n---\n";
        let doc = parse_str(text).unwrap();
        assert_eq!(
            doc.warnings,
            vec![Warning::UnknownKey {
                key: "fancy_extra".to_string()
            }]
        );
    }

    #[test]
    fn duplicate_sibling_step_ids_fail_validation() {
        let text = "---\nworkflow:\n  id: demo\n  name: Demo\nsteps:\n  - id: s1\n    type: action\n    action: core.set\n    inputs: {}\n  - id: s1\n    type: action\n    action: core.set\n    inputs: {}\n---\n";
        let err = parse_str(text).unwrap_err();
        assert!(matches!(err, Error::InvalidSchema { .. }));
    }

    #[test]
    fn malformed_expression_fails_at_parse_time() {
        let text = "---\nworkflow:\n  id: demo\n  name: Demo\nsteps:\n  - id: s1\n    type: if\n    condition: \"a ===\"\n    then: []\n---\n";
        let err = parse_str(text).unwrap_err();
        assert!(matches!(err, Error::Expression { .. }));
    }

    #[test]
    fn workflow_survives_a_serialize_parse_round_trip() {
        let doc = parse_str(MINIMAL).unwrap();

        let yaml = serde_yaml::to_string(&doc.workflow).unwrap();
        let reparsed: Workflow = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc.workflow, reparsed);
    }

    use proptest::prelude::*;

    proptest! {
        /// The narrative Markdown body after the closing fence must survive
        /// verbatim regardless of its content, as long as it doesn't itself
        /// contain a line that looks like a closing fence.
        #[test]
        fn markdown_body_is_preserved_verbatim(
            id in "[a-z][a-z0-9-]{0,12}",
            body_line in "[a-zA-Z0-9][^\\n\\r]{0,40}",
        ) {
            let text = format!(
                "---\nworkflow:\n  id: {id}\n  name: Demo\nsteps: []\n---\n{body_line}\n"
            );
            let doc = parse_str(&text).unwrap();
            prop_assert_eq!(doc.workflow.workflow.id, id);
            prop_assert!(doc.markdown.starts_with(&body_line));
        }
    }
}
