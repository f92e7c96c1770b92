use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Subgraph scalars arrive as strings, but some gateways render small integers as JSON
/// numbers. Both collapse to the decimal string form.
pub fn string_or_number<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(d)?;
    scalar_to_string(&v).ok_or_else(|| D::Error::custom(format!("expected string or number, got {v}")))
}

pub fn opt_string_or_number<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(d)?;
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => scalar_to_string(&v)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("expected string or number, got {v}"))),
    }
}

pub fn parse_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        return s.trim().parse::<u64>().ok();
    }
    v.as_u64()
}

fn scalar_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
