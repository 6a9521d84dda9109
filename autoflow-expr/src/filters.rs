//! ABOUTME: Built-in pipe filters applied by `expr | name(args)`

use autoflow_core::Value;

pub fn apply(name: &str, input: Value, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "upper" => as_string(&input, name).map(|s| Value::string(s.to_uppercase())),
        "lower" => as_string(&input, name).map(|s| Value::string(s.to_lowercase())),
        "title" => as_string(&input, name).map(|s| Value::string(title_case(s))),
        "trim" => as_string(&input, name).map(|s| Value::string(s.trim())),
        "length" => length(&input),
        "default" => {
            let fallback = args
                .into_iter()
                .next()
                .ok_or_else(|| "default() requires one argument".to_string())?;
            Ok(if input.is_null_or_undefined() {
                fallback
            } else {
                input
            })
        }
        "merge" => {
            let other = args
                .into_iter()
                .next()
                .ok_or_else(|| "merge() requires one argument".to_string())?;
            merge(input, other)
        }
        other => Err(format!("unknown filter '{other}'")),
    }
}

fn as_string<'a>(value: &'a Value, filter: &str) -> Result<&'a str, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!(
            "filter '{filter}' expects a string, found {}",
            other.type_name()
        )),
    }
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

fn length(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
        Value::List(items) => Ok(Value::Number(items.len() as f64)),
        Value::Map(map) => Ok(Value::Number(map.len() as f64)),
        other => Err(format!(
            "filter 'length' expects a string, array, or object, found {}",
            other.type_name()
        )),
    }
}

fn merge(input: Value, other: Value) -> Result<Value, String> {
    match (input, other) {
        (Value::Map(mut a), Value::Map(b)) => {
            for (key, value) in b {
                a.insert(key, value);
            }
            Ok(Value::Map(a))
        }
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (a, b) => Err(format!(
            "filter 'merge' expects two objects or two arrays, found {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_lower_trim() {
        assert_eq!(
            apply("upper", Value::string(" hi "), vec![]).unwrap(),
            Value::string(" HI ")
        );
        assert_eq!(
            apply("trim", Value::string(" hi "), vec![]).unwrap(),
            Value::string("hi")
        );
        assert_eq!(
            apply("lower", Value::string("HI"), vec![]).unwrap(),
            Value::string("hi")
        );
    }

    #[test]
    fn title_case_capitalizes_each_word() {
        assert_eq!(
            apply("title", Value::string("deploy report"), vec![]).unwrap(),
            Value::string("Deploy Report")
        );
    }

    #[test]
    fn default_substitutes_on_undefined() {
        assert_eq!(
            apply("default", Value::Undefined, vec![Value::string("anon")]).unwrap(),
            Value::string("anon")
        );
        assert_eq!(
            apply("default", Value::string("set"), vec![Value::string("anon")]).unwrap(),
            Value::string("set")
        );
    }

    #[test]
    fn length_of_string_list_map() {
        assert_eq!(apply("length", Value::string("abc"), vec![]).unwrap(), Value::Number(3.0));
        assert_eq!(
            apply(
                "length",
                Value::List(vec![Value::Number(1.0), Value::Number(2.0)]),
                vec![]
            )
            .unwrap(),
            Value::Number(2.0)
        );
    }

    #[test]
    fn merge_concatenates_lists() {
        let a = Value::List(vec![Value::Number(1.0)]);
        let b = Value::List(vec![Value::Number(2.0)]);
        assert_eq!(
            apply("merge", a, vec![b]).unwrap(),
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
    }
}
