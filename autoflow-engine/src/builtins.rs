//! ABOUTME: `core.*` built-in operations — dispatched internally, never via the executor
//! ABOUTME: contract. `core.set`, `core.transform` (map/filter/reduce/find/group_by/unique/sort),
//! ABOUTME: `core.extract`, and `core.format`.

use autoflow_core::{Error, Scope, Value};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use indexmap::IndexMap;

/// Dispatches a `core.<op>` action. `op` excludes the `core.` prefix.
/// `raw_inputs` are unresolved template-expression strings (action inputs
/// as authored); each built-in resolves the subset of fields it needs.
pub fn dispatch(
    op: &str,
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    match op {
        "set" => op_set(raw_inputs, scope),
        "transform" => op_transform(raw_inputs, scope),
        "extract" => op_extract(raw_inputs, scope),
        "format" => op_format(raw_inputs, scope),
        other => Err(Error::UnknownOperation {
            operation: other.to_string(),
        }),
    }
}

fn expr_field(raw_inputs: &IndexMap<String, String>, name: &str) -> Option<&str> {
    raw_inputs.get(name).map(String::as_str)
}

fn required_expr(raw_inputs: &IndexMap<String, String>, name: &str) -> Result<&str, Error> {
    expr_field(raw_inputs, name).ok_or_else(|| Error::Type {
        message: format!("core built-in requires '{name}'"),
    })
}

fn eval(source: &str, scope: &Scope) -> Result<Value, Error> {
    autoflow_expr::evaluate(source, scope).map_err(|e| Error::Type { message: e.message })
}

fn resolve(source: &str, scope: &Scope) -> Result<Value, Error> {
    autoflow_expr::resolve_input_value(source, scope).map_err(|e| Error::Type { message: e.message })
}

/// Reads a field meant to carry a typed literal (bool, number, or a
/// quoted/collection literal) rather than rendered template text — e.g.
/// `reverse`, `precision`, `initialValue`, `default`. Evaluated as a bare
/// expression so `reverse: false` stays a `Bool`, not the truthy string
/// `"false"`.
fn literal_field(
    raw_inputs: &IndexMap<String, String>,
    name: &str,
    scope: &Scope,
) -> Result<Option<Value>, Error> {
    match expr_field(raw_inputs, name) {
        Some(source) => Ok(Some(eval(source, scope)?)),
        None => Ok(None),
    }
}

fn truthy_field(
    raw_inputs: &IndexMap<String, String>,
    name: &str,
    scope: &Scope,
    default: bool,
) -> Result<bool, Error> {
    Ok(literal_field(raw_inputs, name, scope)?.map_or(default, |v| v.is_truthy()))
}

// -- core.set ----------------------------------------------------------

fn op_set(raw_inputs: &IndexMap<String, String>, scope: &Scope) -> Result<Value, Error> {
    let mut out = IndexMap::new();
    for (key, template) in raw_inputs {
        out.insert(key.clone(), resolve(template, scope)?);
    }
    Ok(Value::Map(out))
}

// -- core.transform ------------------------------------------------------

fn op_transform(raw_inputs: &IndexMap<String, String>, scope: &Scope) -> Result<Value, Error> {
    let input_source = required_expr(raw_inputs, "input")?;
    let input_value = eval(input_source, scope)?;
    let items = input_value.as_sequence().ok_or_else(|| Error::Type {
        message: format!(
            "core.transform requires a sequence input, found {}",
            input_value.type_name()
        ),
    })?;
    let items = items.to_vec();

    let operation = expr_field(raw_inputs, "operation")
        .map(str::trim)
        .ok_or_else(|| Error::Type {
            message: "core.transform requires 'operation'".to_string(),
        })?;

    match operation {
        "map" => transform_map(&items, raw_inputs, scope),
        "filter" => transform_filter(&items, raw_inputs, scope),
        "reduce" => transform_reduce(&items, raw_inputs, scope),
        "find" => transform_find(&items, raw_inputs, scope),
        "group_by" => transform_group_by(&items, raw_inputs, scope),
        "unique" => transform_unique(&items, raw_inputs, scope),
        "sort" => transform_sort(&items, raw_inputs, scope),
        other => Err(Error::UnknownOperation {
            operation: other.to_string(),
        }),
    }
}

fn item_scope(base: &Scope, item: &Value, index: usize) -> Scope {
    let mut scope = base.clone();
    scope.push_frame();
    scope.bind("item", item.clone());
    scope.bind("index", Value::Number(index as f64));
    scope
}

/// Shared by `core.transform operation: map` and the step-level `map` kind.
pub(crate) fn transform_map_with(
    items: &[Value],
    expression: &str,
    scope: &Scope,
) -> Result<Value, Error> {
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let iter_scope = item_scope(scope, item, index);
        out.push(eval(expression, &iter_scope)?);
    }
    Ok(Value::List(out))
}

fn transform_map(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let expression = required_expr(raw_inputs, "expression")?;
    transform_map_with(items, expression, scope)
}

/// Shared by `core.transform operation: filter` and the step-level `filter` kind.
pub(crate) fn transform_filter_with(
    items: &[Value],
    condition: &str,
    scope: &Scope,
) -> Result<Value, Error> {
    let mut out = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let iter_scope = item_scope(scope, item, index);
        if eval(condition, &iter_scope)?.is_truthy() {
            out.push(item.clone());
        }
    }
    Ok(Value::List(out))
}

fn transform_filter(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let condition = required_expr(raw_inputs, "condition")?;
    transform_filter_with(items, condition, scope)
}

/// Shared by `core.transform operation: reduce` and the step-level `reduce`
/// kind, which carries `initial_value` as an already-literal JSON value
/// rather than a template string and may bind the running total under a
/// custom `accumulator_variable` instead of the default `accumulator`.
pub(crate) fn transform_reduce_with(
    items: &[Value],
    expression: &str,
    initial: Value,
    accumulator_variable: &str,
    scope: &Scope,
) -> Result<Value, Error> {
    let mut accumulator = initial;
    for (index, item) in items.iter().enumerate() {
        let mut iter_scope = item_scope(scope, item, index);
        iter_scope.bind(accumulator_variable, accumulator.clone());
        accumulator = eval(expression, &iter_scope)?;
    }
    Ok(accumulator)
}

fn transform_reduce(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let expression = required_expr(raw_inputs, "expression")?;
    let initial = literal_field(raw_inputs, "initialValue", scope)?.ok_or_else(|| Error::Type {
        message: "core.transform reduce requires 'initialValue'".to_string(),
    })?;
    transform_reduce_with(items, expression, initial, "accumulator", scope)
}

fn transform_find(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let condition = required_expr(raw_inputs, "condition")?;
    for (index, item) in items.iter().enumerate() {
        let iter_scope = item_scope(scope, item, index);
        if eval(condition, &iter_scope)?.is_truthy() {
            return Ok(item.clone());
        }
    }
    Ok(Value::Undefined)
}

fn transform_group_by(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let key_expr = required_expr(raw_inputs, "key")?;
    let mut groups: IndexMap<String, Vec<Value>> = IndexMap::new();
    for (index, item) in items.iter().enumerate() {
        let iter_scope = item_scope(scope, item, index);
        let key = eval(key_expr, &iter_scope)?.to_template_string();
        groups.entry(key).or_default().push(item.clone());
    }
    Ok(Value::Map(
        groups
            .into_iter()
            .map(|(k, v)| (k, Value::List(v)))
            .collect(),
    ))
}

fn transform_unique(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let key_expr = expr_field(raw_inputs, "key");
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let fingerprint = match key_expr {
            Some(expr) => {
                let iter_scope = item_scope(scope, item, index);
                eval(expr, &iter_scope)?.to_template_string()
            }
            None => item.to_template_string(),
        };
        if !seen.contains(&fingerprint) {
            seen.push(fingerprint);
            out.push(item.clone());
        }
    }
    Ok(Value::List(out))
}

fn transform_sort(
    items: &[Value],
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let key_expr = expr_field(raw_inputs, "key");
    let reverse = truthy_field(raw_inputs, "reverse", scope, false)?;

    let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let sort_key = match key_expr {
            Some(expr) => {
                let iter_scope = item_scope(scope, item, index);
                eval(expr, &iter_scope)?
            }
            None => item.clone(),
        };
        keyed.push((sort_key, item.clone()));
    }

    keyed.sort_by(|(a, _), (b, _)| compare_values(a, b));
    if reverse {
        keyed.reverse();
    }
    Ok(Value::List(keyed.into_iter().map(|(_, v)| v).collect()))
}

/// Numeric items compare numerically, everything else lexicographically by
/// template-stringified representation, per 
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_template_string().cmp(&b.to_template_string()),
    }
}

// -- core.extract --------------------------------------------------------

fn op_extract(raw_inputs: &IndexMap<String, String>, scope: &Scope) -> Result<Value, Error> {
    let input_source = required_expr(raw_inputs, "input")?;
    let input_value = eval(input_source, scope)?;
    let path = required_expr(raw_inputs, "path")?;
    let default = literal_field(raw_inputs, "default", scope)?.unwrap_or(Value::Null);

    let result = walk_path(&input_value, path);
    Ok(if result.is_undefined() { default } else { result })
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        let mut rest = dotted;
        loop {
            if let Some(bracket_start) = rest.find('[') {
                if bracket_start > 0 {
                    segments.push(PathSegment::Key(rest[..bracket_start].to_string()));
                }
                let after = &rest[bracket_start + 1..];
                let Some(close) = after.find(']') else {
                    break;
                };
                let inner = after[..close].trim_matches(|c| c == '"' || c == '\'');
                if let Ok(index) = inner.parse::<usize>() {
                    segments.push(PathSegment::Index(index));
                } else if !inner.is_empty() {
                    segments.push(PathSegment::Key(inner.to_string()));
                }
                rest = &after[close + 1..];
            } else {
                if !rest.is_empty() {
                    segments.push(PathSegment::Key(rest.to_string()));
                }
                break;
            }
        }
    }
    segments
}

/// Never raises on a missing segment: returns `Value::Undefined` instead
/// of an error, so a chained accessor can probe optional data freely.
fn walk_path(root: &Value, path: &str) -> Value {
    let mut current = root.clone();
    for segment in parse_path(path) {
        if current.is_undefined() {
            return Value::Undefined;
        }
        current = match segment {
            PathSegment::Key(key) => current.get_key(&key),
            PathSegment::Index(index) => current.get_index(index),
        };
    }
    current
}

// -- core.format ----------------------------------------------------------

fn op_format(raw_inputs: &IndexMap<String, String>, scope: &Scope) -> Result<Value, Error> {
    let value_source = required_expr(raw_inputs, "value")?;
    let value = eval(value_source, scope)?;
    let ty = required_expr(raw_inputs, "type")?.trim();

    match ty {
        "date" => format_date(&value, raw_inputs, scope),
        "number" => format_number(&value, raw_inputs, scope),
        "currency" => format_currency(&value, raw_inputs, scope),
        "string" => format_string(&value, raw_inputs, scope),
        "json" => format_json(&value),
        other => Err(Error::Type {
            message: format!("core.format: unknown type '{other}'"),
        }),
    }
}

fn parse_date_value(value: &Value) -> Result<DateTime<Utc>, Error> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                    .map(|naive| Utc.from_utc_datetime(&naive))
            })
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()))
            })
            .map_err(|e| Error::Type {
                message: format!("core.format: cannot parse '{s}' as a date: {e}"),
            }),
        Value::Number(epoch_seconds) => Utc
            .timestamp_opt(*epoch_seconds as i64, 0)
            .single()
            .ok_or_else(|| Error::Type {
                message: "core.format: timestamp out of range".to_string(),
            }),
        other => Err(Error::Type {
            message: format!(
                "core.format: date value must be a string or epoch number, found {}",
                other.type_name()
            ),
        }),
    }
}

fn format_date(
    value: &Value,
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let dt = parse_date_value(value)?;
    let pattern = match expr_field(raw_inputs, "format") {
        Some(source) => resolve(source, scope)?.to_template_string(),
        None => "YYYY-MM-DD".to_string(),
    };
    let rendered = pattern
        .replace("YYYY", &format!("{:04}", dt.year()))
        .replace("MM", &format!("{:02}", dt.month()))
        .replace("DD", &format!("{:02}", dt.day()))
        .replace("HH", &format!("{:02}", dt.hour()))
        .replace("mm", &format!("{:02}", dt.minute()))
        .replace("ss", &format!("{:02}", dt.second()));
    Ok(Value::string(rendered))
}

fn read_precision(raw_inputs: &IndexMap<String, String>, scope: &Scope) -> Result<usize, Error> {
    Ok(literal_field(raw_inputs, "precision", scope)?
        .and_then(|v| v.as_f64())
        .unwrap_or(2.0)
        .max(0.0) as usize)
}

fn format_number(
    value: &Value,
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let n = value.as_f64().ok_or_else(|| Error::Type {
        message: format!(
            "core.format: number value must be numeric, found {}",
            value.type_name()
        ),
    })?;
    let precision = read_precision(raw_inputs, scope)?;
    Ok(Value::string(format!("{n:.precision$}")))
}

fn format_currency(
    value: &Value,
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let n = value.as_f64().ok_or_else(|| Error::Type {
        message: format!(
            "core.format: currency value must be numeric, found {}",
            value.type_name()
        ),
    })?;
    let precision = read_precision(raw_inputs, scope)?;
    let currency = match expr_field(raw_inputs, "currency") {
        Some(source) => resolve(source, scope)?.to_template_string(),
        None => "USD".to_string(),
    };
    let symbol = match currency.as_str() {
        "USD" => "$".to_string(),
        "EUR" => "\u{20ac}".to_string(),
        "GBP" => "\u{a3}".to_string(),
        other => format!("{other} "),
    };
    Ok(Value::string(format!("{symbol}{n:.precision$}")))
}

fn format_string(
    value: &Value,
    raw_inputs: &IndexMap<String, String>,
    scope: &Scope,
) -> Result<Value, Error> {
    let text = value.to_template_string();
    let mode = match expr_field(raw_inputs, "format") {
        Some(source) => resolve(source, scope)?.to_template_string(),
        None => "trim".to_string(),
    };
    let rendered = match mode.as_str() {
        "upper" => text.to_uppercase(),
        "lower" => text.to_lowercase(),
        "title" => title_case(&text),
        "capitalize" => capitalize(&text),
        "trim" => text.trim().to_string(),
        other => {
            return Err(Error::Type {
                message: format!("core.format: unknown string format '{other}'"),
            })
        }
    };
    Ok(Value::string(rendered))
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn format_json(value: &Value) -> Result<Value, Error> {
    let json: serde_json::Value = value.clone().into();
    let pretty = serde_json::to_string_pretty(&json).map_err(|e| Error::Type {
        message: format!("core.format: json serialisation failed: {e}"),
    })?;
    Ok(Value::string(pretty))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn set_resolves_every_value_as_template() {
        let mut scope = Scope::new();
        scope.bind_at_root("name", Value::string("Ada"));
        let result = op_set(&inputs(&[("greeting", "hi {{ name }}")]), &scope).unwrap();
        assert_eq!(result.get_key("greeting"), Value::string("hi Ada"));
    }

    #[test]
    fn transform_map_then_filter_then_reduce_scenario() {
        let mut scope = Scope::new();
        scope.bind_at_root(
            "numbers",
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0),
                Value::Number(4.0),
                Value::Number(5.0),
            ]),
        );

        let doubled = op_transform(
            &inputs(&[
                ("input", "numbers"),
                ("operation", "map"),
                ("expression", "item * 2"),
            ]),
            &scope,
        )
        .unwrap();
        scope.bind_at_root("doubled", doubled);

        let filtered = op_transform(
            &inputs(&[
                ("input", "doubled"),
                ("operation", "filter"),
                ("condition", "item > 5"),
            ]),
            &scope,
        )
        .unwrap();
        scope.bind_at_root("filtered", filtered);

        let total = op_transform(
            &inputs(&[
                ("input", "filtered"),
                ("operation", "reduce"),
                ("expression", "accumulator + item"),
                ("initialValue", "0"),
            ]),
            &scope,
        )
        .unwrap();

        assert_eq!(total, Value::Number(24.0));
    }

    #[test]
    fn transform_group_by_departments() {
        let mut scope = Scope::new();
        let users = Value::List(vec![
            Value::Map(IndexMap::from([
                ("name".to_string(), Value::string("A")),
                ("dept".to_string(), Value::string("eng")),
            ])),
            Value::Map(IndexMap::from([
                ("name".to_string(), Value::string("B")),
                ("dept".to_string(), Value::string("sales")),
            ])),
            Value::Map(IndexMap::from([
                ("name".to_string(), Value::string("C")),
                ("dept".to_string(), Value::string("eng")),
            ])),
        ]);
        scope.bind_at_root("users", users);

        let grouped = op_transform(
            &inputs(&[
                ("input", "users"),
                ("operation", "group_by"),
                ("key", "item.dept"),
            ]),
            &scope,
        )
        .unwrap();

        let eng = grouped.get_key("eng");
        assert_eq!(eng.as_sequence().unwrap().len(), 2);
        let sales = grouped.get_key("sales");
        assert_eq!(sales.as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn transform_on_non_sequence_is_type_error() {
        let mut scope = Scope::new();
        scope.bind_at_root("x", Value::Number(1.0));
        let err = op_transform(
            &inputs(&[("input", "x"), ("operation", "map"), ("expression", "item")]),
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Type { .. }));
    }

    #[test]
    fn unknown_transform_operation_errors() {
        let mut scope = Scope::new();
        scope.bind_at_root("x", Value::List(vec![]));
        let err = op_transform(&inputs(&[("input", "x"), ("operation", "frobnicate")]), &scope)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownOperation { .. }));
    }

    #[test]
    fn extract_never_throws_on_missing_path() {
        let mut scope = Scope::new();
        scope.bind_at_root(
            "data",
            Value::Map(IndexMap::from([(
                "items".to_string(),
                Value::List(vec![Value::Map(IndexMap::from([(
                    "name".to_string(),
                    Value::string("first"),
                )]))]),
            )])),
        );

        let found = op_extract(
            &inputs(&[("input", "data"), ("path", "items[0].name")]),
            &scope,
        )
        .unwrap();
        assert_eq!(found, Value::string("first"));

        let missing = op_extract(
            &inputs(&[
                ("input", "data"),
                ("path", "items[5].name"),
                ("default", "\"none\""),
            ]),
            &scope,
        )
        .unwrap();
        assert_eq!(missing, Value::string("none"));
    }

    #[test]
    fn format_string_operations() {
        let scope = Scope::new();
        let upper = op_format(
            &inputs(&[("value", "\"deploy report\""), ("type", "string"), ("format", "title")]),
            &scope,
        )
        .unwrap();
        assert_eq!(upper, Value::string("Deploy Report"));
    }

    #[test]
    fn format_json_pretty_prints() {
        let scope = Scope::new();
        let out = op_format(&inputs(&[("value", "[1, 2]"), ("type", "json")]), &scope).unwrap();
        assert_eq!(out, Value::string("[\n  1,\n  2\n]"));
    }

    #[test]
    fn sort_numeric_is_numeric_not_lexicographic() {
        let mut scope = Scope::new();
        scope.bind_at_root(
            "values",
            Value::List(vec![
                Value::Number(10.0),
                Value::Number(2.0),
                Value::Number(1.0),
            ]),
        );
        let sorted = op_transform(
            &inputs(&[("input", "values"), ("operation", "sort")]),
            &scope,
        )
        .unwrap();
        assert_eq!(
            sorted,
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(10.0)
            ])
        );
    }
}
