//! Reading TOML config files with [`toml_span`].

use toml_span::{Span, value::ValueInner};

use crate::prelude::*;

/// Parse a TOML document into JSON, so serde can take it from there.
///
/// Errors point at the line and column of the offending text.
pub fn toml_to_json(toml_str: &str) -> Result<Value> {
    let mut value = toml_span::parse(toml_str)
        .map_err(|err| anyhow!("{err} (at {})", location(toml_str, err.span)))?;
    to_json(toml_str, &mut value)
}

fn to_json(src: &str, value: &mut toml_span::Value<'_>) -> Result<Value> {
    let span = value.span;
    Ok(match value.take() {
        ValueInner::String(s) => Value::String(s.into_owned()),
        ValueInner::Integer(i) => Value::from(i),
        ValueInner::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| anyhow!("{f} is not a finite number (at {})", location(src, span)))?,
        ValueInner::Boolean(b) => Value::Bool(b),
        ValueInner::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|mut v| to_json(src, &mut v))
                .collect::<Result<_>>()?,
        ),
        ValueInner::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(key, mut v)| Ok((key.name.into_owned(), to_json(src, &mut v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

/// The 1-based line and column where `span` starts.
fn location(src: &str, span: Span) -> String {
    let before = src.get(..span.start).unwrap_or(src);
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    format!("line {line}, column {column}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_to_json() {
        let value = toml_to_json(
            r#"
max_concurrent_gpu = 3
job_timeout_secs = 1.5

[nested]
names = ["a", "b"]
enabled = true
"#,
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "max_concurrent_gpu": 3,
                "job_timeout_secs": 1.5,
                "nested": { "names": ["a", "b"], "enabled": true },
            })
        );
    }

    #[test]
    fn test_syntax_errors_have_locations() {
        let err = toml_to_json("a = 1\nb = = 2\n").unwrap_err().to_string();
        assert!(err.contains("line 2"), "{err}");
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        let err = toml_to_json("x = nan\n").unwrap_err().to_string();
        assert!(err.contains("not a finite number"), "{err}");
    }
}
