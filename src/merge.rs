//! Deep merge of partial updates into state values.
//!
//! A [`Patch`] is the recursively-optional companion of a JSON-shaped state:
//! every field is either absent (kept from the base), replaced, recursed
//! into, or explicitly removed. Removal happens only through the typed
//! [`Patch::Remove`] sentinel - `Patch::Set(Value::Null)` stores a JSON
//! null and never deletes a key.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

/// A partial update to a JSON-shaped state value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Patch {
    /// Recurse into an object, merging field by field.
    Object(BTreeMap<String, Patch>),
    /// Replace the value at this position outright.
    Set(Value),
    /// Remove the key this patch is attached to.
    Remove,
}

impl Patch {
    /// Replace with the given value.
    pub fn set(value: impl Into<Value>) -> Self {
        Patch::Set(value.into())
    }

    /// Build an object patch from key/patch pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Patch)>,
    {
        Patch::Object(fields.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }

    /// True if the patch changes nothing (an empty object).
    pub fn is_empty(&self) -> bool {
        matches!(self, Patch::Object(map) if map.is_empty())
    }
}

/// A plain JSON value converts into merge semantics: objects recurse,
/// everything else replaces.
impl From<Value> for Patch {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Patch::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Patch::from(v)))
                    .collect(),
            ),
            other => Patch::Set(other),
        }
    }
}

/// Merge a patch over a base value, producing a new value.
///
/// Every key of the base not named by the patch is preserved; keys named by
/// the patch recurse (object patch over object base) or are replaced. The
/// base is never mutated. A non-object base under an object patch is
/// replaced wholesale, as if merging over an empty object.
pub fn deep_merge(base: &Value, patch: &Patch) -> Value {
    match patch {
        Patch::Set(value) => value.clone(),
        // A bare Remove has no enclosing key to delete.
        Patch::Remove => Value::Null,
        Patch::Object(fields) => {
            let mut out = match base {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            for (key, sub) in fields {
                match sub {
                    Patch::Remove => {
                        out.remove(key);
                    }
                    _ => {
                        let prior = out.get(key).cloned().unwrap_or(Value::Null);
                        out.insert(key.clone(), deep_merge(&prior, sub));
                    }
                }
            }
            Value::Object(out)
        }
    }
}

/// How selector slices are compared to decide whether a subscriber re-fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Equality {
    /// One level only: scalars compare by value, matching containers at
    /// depth >= 1 are conservatively treated as unequal. Over-notifies,
    /// never under-notifies.
    Shallow,
    /// Full structural equality.
    #[default]
    Deep,
}

impl Equality {
    /// Compare two selected slices under this policy.
    pub fn eval(&self, a: &Value, b: &Value) -> bool {
        match self {
            Equality::Deep => a == b,
            Equality::Shallow => shallow_eq(a, b),
        }
    }
}

fn is_scalar(v: &Value) -> bool {
    !matches!(v, Value::Object(_) | Value::Array(_))
}

fn shallow_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            ma.len() == mb.len()
                && ma.iter().all(|(k, va)| {
                    mb.get(k)
                        .is_some_and(|vb| is_scalar(va) && is_scalar(vb) && va == vb)
                })
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| is_scalar(x) && is_scalar(y) && x == y)
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_preserves_unnamed_keys() {
        let base = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let patch = Patch::from(json!({"b": {"c": 9}}));

        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": 1, "b": {"c": 9, "d": 3}}));
        // Base untouched.
        assert_eq!(base, json!({"a": 1, "b": {"c": 2, "d": 3}}));
    }

    #[test]
    fn test_merge_replaces_non_object_leaves() {
        let base = json!({"a": [1, 2], "b": "old"});
        let patch = Patch::from(json!({"a": [3], "b": "new"}));

        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": [3], "b": "new"}));
    }

    #[test]
    fn test_merge_adds_missing_keys() {
        let base = json!({"a": 1});
        let patch = Patch::from(json!({"b": {"c": 2}}));

        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": 1, "b": {"c": 2}}));
    }

    #[test]
    fn test_null_overwrites_but_does_not_remove() {
        let base = json!({"a": 1, "b": 2});
        let patch = Patch::from(json!({"a": null}));

        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": null, "b": 2}));
    }

    #[test]
    fn test_remove_sentinel_deletes_key() {
        let base = json!({"a": 1, "b": {"c": 2, "d": 3}});
        let patch = Patch::object([(
            "b",
            Patch::object([("c", Patch::Remove)]),
        )]);

        let merged = deep_merge(&base, &patch);
        assert_eq!(merged, json!({"a": 1, "b": {"d": 3}}));
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let base = json!({"a": 1});
        let patch = Patch::object([("zzz", Patch::Remove)]);

        assert_eq!(deep_merge(&base, &patch), json!({"a": 1}));
    }

    #[test]
    fn test_object_patch_over_scalar_base() {
        let base = json!({"a": 5});
        let patch = Patch::from(json!({"a": {"nested": true}}));

        assert_eq!(deep_merge(&base, &patch), json!({"a": {"nested": true}}));
    }

    #[test]
    fn test_deep_equality() {
        let eq = Equality::Deep;
        assert!(eq.eval(&json!({"a": {"b": 1}}), &json!({"a": {"b": 1}})));
        assert!(!eq.eval(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}})));
    }

    #[test]
    fn test_shallow_equality_scalars() {
        let eq = Equality::Shallow;
        assert!(eq.eval(&json!({"a": 1, "b": "x"}), &json!({"a": 1, "b": "x"})));
        assert!(!eq.eval(&json!({"a": 1}), &json!({"a": 2})));
        assert!(!eq.eval(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_shallow_equality_is_conservative_on_nesting() {
        // Nested containers never compare equal at depth 1.
        let eq = Equality::Shallow;
        assert!(!eq.eval(&json!({"a": {"b": 1}}), &json!({"a": {"b": 1}})));
        assert!(eq.eval(&json!(7), &json!(7)));
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(Patch::from(json!({})).is_empty());
        assert!(!Patch::from(json!({"a": 1})).is_empty());
        assert!(!Patch::set(json!(1)).is_empty());
    }
}
