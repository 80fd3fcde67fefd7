// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device state cache merge.
//!
//! Each device session keeps one JSON object describing everything the
//! device has reported. Updates are folded in with [`merge`], whose return
//! value decides whether anything needs to go upstream.

use serde_json::{Map, Value};

/// Recursively merge `update` into `base`, returning whether `base` changed.
///
/// - Non-object updates are ignored (`false`).
/// - A non-object `base` is replaced by an empty object first.
/// - Keys holding objects on both sides are merged recursively; any other
///   key is overwritten when absent or unequal.
///
/// ```
/// use roomhub::merge;
/// use serde_json::json;
///
/// let mut state = json!({"light": {"on": false, "level": 3}});
/// assert!(merge(&mut state, &json!({"light": {"on": true}})));
/// assert_eq!(state, json!({"light": {"on": true, "level": 3}}));
/// assert!(!merge(&mut state, &json!({"light": {"on": true}})));
/// ```
pub fn merge(base: &mut Value, update: &Value) -> bool {
    let Value::Object(update) = update else {
        return false;
    };
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    match base {
        Value::Object(base) => merge_objects(base, update),
        _ => false,
    }
}

fn merge_objects(base: &mut Map<String, Value>, update: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (key, incoming) in update {
        match base.get_mut(key) {
            Some(current) if current.is_object() && incoming.is_object() => {
                changed |= merge(current, incoming);
            }
            Some(current) => {
                if current != incoming {
                    *current = incoming.clone();
                    changed = true;
                }
            }
            None => {
                base.insert(key.clone(), incoming.clone());
                changed = true;
            }
        }
    }
    changed
}

// ============================================================================
// Tests
// ============================================================================
