//! Byte-size estimation for cached values.
//!
//! Sizes approximate the in-memory footprint of a JSON value: every node pays
//! a fixed header, strings pay their UTF-8 length, containers pay a slot per
//! element plus the size of what they hold. The numbers only need to be
//! consistent, since they price cache entries against each other and against
//! a configured budget.

use serde_json::Value;

/// Header charged for a null node
const NULL_SIZE: usize = 16;
/// Header charged for a boolean node
const BOOL_SIZE: usize = 24;
/// Header charged for a number node
const NUMBER_SIZE: usize = 32;
/// Header charged for a string node, before its bytes
const STR_HEADER: usize = 48;
/// Header charged for an array node, before its slots
const ARRAY_HEADER: usize = 56;
/// Header charged for an object node, before its slots
const OBJECT_HEADER: usize = 64;
/// Per-element slot inside a container
const SLOT_SIZE: usize = 8;

/// Size of a bare string (used for keys).
pub fn str_size(s: &str) -> usize {
    STR_HEADER + s.len()
}

/// Size of the top-level node only: string bytes are included, container
/// children are not.
pub fn shallow_size(value: &Value) -> usize {
    match value {
        Value::Null => NULL_SIZE,
        Value::Bool(_) => BOOL_SIZE,
        Value::Number(_) => NUMBER_SIZE,
        Value::String(s) => str_size(s),
        Value::Array(items) => ARRAY_HEADER + SLOT_SIZE * items.len(),
        Value::Object(map) => OBJECT_HEADER + 2 * SLOT_SIZE * map.len(),
    }
}

/// Size of a value and everything it contains.
///
/// Walks with an explicit stack, so nesting depth is bounded by the heap
/// rather than the call stack. A `Value` owns its children, so there are no
/// cycles to guard against.
pub fn deep_size(value: &Value) -> usize {
    let mut total = 0usize;
    let mut stack = vec![value];
    while let Some(node) = stack.pop() {
        total += shallow_size(node);
        match node {
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => {
                for (k, v) in map {
                    total += str_size(k);
                    stack.push(v);
                }
            }
            _ => {}
        }
    }
    total
}

/// Price of one cache entry: its key plus its deep value size.
pub fn entry_size(key: &str, value: &Value) -> usize {
    str_size(key) + deep_size(value)
}

/// Render a byte count as `B/KB/MB/GB/TB` with one decimal.
pub fn humanize_bytes(n: usize) -> String {
    let mut size = n as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(deep_size(&json!(null)), NULL_SIZE);
        assert_eq!(deep_size(&json!(true)), BOOL_SIZE);
        assert_eq!(deep_size(&json!(42)), NUMBER_SIZE);
        assert_eq!(deep_size(&json!("abc")), STR_HEADER + 3);
    }

    #[test]
    fn test_shallow_excludes_children() {
        let v = json!({"a": "x".repeat(1000)});
        assert!(shallow_size(&v) < 100);
        assert!(deep_size(&v) > 1000);
    }

    #[test]
    fn test_deep_counts_nested() {
        let flat = json!([1, 2]);
        let nested = json!([1, [2, [3]]]);
        assert!(deep_size(&nested) > deep_size(&flat));
        assert_eq!(
            deep_size(&flat),
            ARRAY_HEADER + 2 * SLOT_SIZE + 2 * NUMBER_SIZE
        );
    }

    #[test]
    fn test_object_keys_are_priced() {
        let short = json!({"k": 1});
        let long = json!({"a_much_longer_key": 1});
        assert_eq!(deep_size(&long) - deep_size(&short), "a_much_longer_key".len() - 1);
    }

    #[test]
    fn test_deep_nesting_does_not_overflow_stack() {
        let mut v = json!(0);
        for _ in 0..2_000 {
            v = Value::Array(vec![v]);
        }
        assert_eq!(
            deep_size(&v),
            2_000 * (ARRAY_HEADER + SLOT_SIZE) + NUMBER_SIZE
        );
    }

    #[test]
    fn test_entry_size() {
        let v = json!("v");
        assert_eq!(entry_size("key", &v), str_size("key") + deep_size(&v));
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize_bytes(512), "512.0 B");
        assert_eq!(humanize_bytes(2048), "2.0 KB");
        assert_eq!(humanize_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
