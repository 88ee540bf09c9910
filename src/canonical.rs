use serde_json::Value;
use sha2::{Digest, Sha256};

/// Panel hashes are the first 12 hex chars of the SHA-256 digest.
pub const PANEL_HASH_LEN: usize = 12;

/// Sentinel strings for floats JSON cannot carry.
pub const NAN_SENTINEL: &str = "__NaN__";
pub const INF_SENTINEL: &str = "__Inf__";
pub const NEG_INF_SENTINEL: &str = "__-Inf__";

/// Convert a float to a canonical JSON value: `-0.0` collapses to `0.0`,
/// non-finite values become sentinel strings. Every producer of panel data
/// goes through this so hashing and resync agree byte-for-byte.
pub fn float_value(f: f64) -> Value {
    if f.is_nan() {
        return Value::String(NAN_SENTINEL.to_string());
    }
    if f.is_infinite() {
        return Value::String(
            if f > 0.0 { INF_SENTINEL } else { NEG_INF_SENTINEL }.to_string(),
        );
    }
    let f = if f == 0.0 { 0.0 } else { f };
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Serialize `value` deterministically: object keys sorted, floats
/// normalized, recursion bounded by `max_depth` (deeper content collapses
/// to a truncation marker so two over-deep payloads still hash stably).
pub fn canonicalize(value: &Value, max_depth: usize) -> String {
    let mut out = String::with_capacity(256);
    write_canonical(value, max_depth, &mut out);
    out
}

fn write_canonical(value: &Value, depth_left: usize, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => {
            // serde_json handles escaping; a String never fails to serialize.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
        }
        Value::Array(items) => {
            if depth_left == 0 {
                out.push_str("\"__truncated__\"");
                return;
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, depth_left - 1, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            if depth_left == 0 {
                out.push_str("\"__truncated__\"");
                return;
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[*key], depth_left - 1, out);
            }
            out.push('}');
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(f) = n.as_f64() {
        if f == 0.0 {
            out.push_str("0.0");
        } else {
            out.push_str(&f.to_string());
        }
    } else {
        out.push_str("null");
    }
}

/// Hash of the canonical form, truncated to `PANEL_HASH_LEN` hex chars.
pub fn panel_hash(data: &Value, max_depth: usize) -> String {
    let canonical = canonicalize(data, max_depth);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..PANEL_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_is_irrelevant() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(panel_hash(&a, 8), panel_hash(&b, 8));
    }

    #[test]
    fn negative_zero_normalizes() {
        let a = json!({ "v": float_value(-0.0) });
        let b = json!({ "v": float_value(0.0) });
        assert_eq!(panel_hash(&a, 8), panel_hash(&b, 8));
    }

    #[test]
    fn non_finite_floats_become_sentinels() {
        assert_eq!(float_value(f64::NAN), json!(NAN_SENTINEL));
        assert_eq!(float_value(f64::INFINITY), json!(INF_SENTINEL));
        assert_eq!(float_value(f64::NEG_INFINITY), json!(NEG_INF_SENTINEL));
    }

    #[test]
    fn identical_data_identical_hash() {
        let v = json!({"indices": [{"symbol": "NIFTY", "ltp": 24000.5}]});
        assert_eq!(panel_hash(&v, 8), panel_hash(&v.clone(), 8));
    }

    #[test]
    fn depth_bound_truncates_stably() {
        let deep = json!({"a": {"b": {"c": {"d": 1}}}});
        let h1 = panel_hash(&deep, 2);
        let h2 = panel_hash(&json!({"a": {"b": {"c": {"d": 2}}}}), 2);
        // Content below the bound no longer participates in the hash.
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_length_is_twelve() {
        assert_eq!(panel_hash(&json!({}), 8).len(), PANEL_HASH_LEN);
    }
}
