//! ABOUTME: Expands `{{ expression }}` segments embedded in a template string
//! ABOUTME: Text outside `{{ }}` passes through verbatim; segments stringify via `Value::to_template_string`

use crate::{eval, parser};
use autoflow_core::Scope;

/// Splits `template` on `{{ ... }}` segments, evaluates each expression
/// against `scope`, and stringifies the result back into the template.
///
/// A `{{` with no matching `}}` is a document error, not silently ignored.
pub fn render(template: &str, scope: &Scope) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = find_segment_end(after_open) else {
            return Err("unterminated '{{' in template".to_string());
        };
        let expr_src = after_open[..end].trim();
        let expr = parser::parse(expr_src).map_err(|e| format!("in `{{{{ {expr_src} }}}}`: {e}"))?;
        let value = eval::eval(&expr, scope).map_err(|e| format!("in `{{{{ {expr_src} }}}}`: {e}"))?;
        out.push_str(&value.to_template_string());
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Finds the `}}` that closes a `{{` segment, respecting quoted strings so a
/// literal `}}` inside a string argument (e.g. `default("}}")`) isn't mistaken
/// for the closing delimiter.
fn find_segment_end(src: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_core::Value;

    #[test]
    fn renders_plain_text_unchanged() {
        let scope = Scope::new();
        assert_eq!(render("hello world", &scope).unwrap(), "hello world");
    }

    #[test]
    fn renders_single_segment() {
        let mut scope = Scope::new();
        scope.bind_at_root("name", Value::string("Ada"));
        assert_eq!(render("hello {{ name }}!", &scope).unwrap(), "hello Ada!");
    }

    #[test]
    fn renders_multiple_segments_with_filters() {
        let mut scope = Scope::new();
        scope.bind_at_root("name", Value::string("ada"));
        scope.bind_at_root("count", Value::Number(3.0));
        assert_eq!(
            render("{{ name | upper }} has {{ count }} items", &scope).unwrap(),
            "ADA has 3 items"
        );
    }

    #[test]
    fn unterminated_segment_is_an_error() {
        let scope = Scope::new();
        assert!(render("hello {{ name", &scope).is_err());
    }

    #[test]
    fn undefined_renders_as_empty_string() {
        let scope = Scope::new();
        assert_eq!(render("[{{ missing }}]", &scope).unwrap(), "[]");
    }
}
