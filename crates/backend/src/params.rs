//! Positional parameter binding for the sqlx backends.
//!
//! JSON scalars map to the closest native type; arrays and objects are bound
//! as JSON documents. Values are always bound, never spliced into SQL text.

/// Bind every value in `$params` onto an sqlx `Query`, in order.
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for value in $params {
            query = match value {
                serde_json::Value::Null => query.bind(None::<String>),
                serde_json::Value::Bool(b) => query.bind(*b),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                serde_json::Value::String(s) => query.bind(s.clone()),
                other => query.bind(sqlx::types::Json(other.clone())),
            };
        }
        query
    }};
}

pub(crate) use bind_params;

/// Parse a CLI-style parameter: JSON literals (`42`, `true`, `null`, `"x"`)
/// keep their type, anything else is a string.
pub fn parse_param(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v @ (serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Number(_)
        | serde_json::Value::String(_))) => v,
        _ => serde_json::Value::String(raw.to_string()),
    }
}
