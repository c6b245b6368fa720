//! Path and value helpers shared by the store backends.
//!
//! A store is one JSON tree. Paths are slash-separated keys into it; objects
//! are interior nodes and everything else is a leaf. Nulls are never stored:
//! writing null deletes, and objects left empty disappear with their last
//! child.

use serde_json::{Map, Value};

use crate::{ChildQuery, Snapshot, StoreError, StoreResult};

pub fn parse_path(path: &str) -> StoreResult<Vec<String>> {
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if segs.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

pub fn join(segs: &[String]) -> String {
    segs.join("/")
}

/// True if one path is equal to or nested under the other.
pub fn overlaps(a: &[String], b: &[String]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

pub fn starts_with(path: &[String], prefix: &[String]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

pub fn get<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

/// Replace the node at `segs` with `value` (already pruned or not).
pub fn set(root: &mut Value, segs: &[String], value: Value) {
    set_in(root, segs, prune(value));
}

fn set_in(node: &mut Value, segs: &[String], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        if rest.is_empty() {
            if value.is_null() {
                map.remove(head);
            } else {
                map.insert(head.clone(), value);
            }
            return;
        }

        let child = map.entry(head.clone()).or_insert(Value::Null);
        set_in(child, rest, value);
        if is_empty(child) {
            map.remove(head);
        }
    }
}

/// Drop nulls and empty objects. Returns `Null` when nothing remains.
pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if kept.is_empty() {
                Value::Null
            } else {
                Value::Object(kept)
            }
        }
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Leaf rows for `value` mounted at `base`.
pub fn flatten(base: &[String], value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    let mut path = base.to_vec();
    flatten_into(&mut path, value, &mut out);
    out
}

fn flatten_into(path: &mut Vec<String>, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                path.push(k.clone());
                flatten_into(path, v, out);
                path.pop();
            }
        }
        leaf => out.push((join(path), leaf.clone())),
    }
}

/// Rebuild the subtree at `base` from leaf rows at or under it.
pub fn unflatten(base: &[String], rows: Vec<(String, Value)>) -> Option<Value> {
    let mut root = Value::Null;

    for (path, leaf) in rows {
        let segs: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !starts_with(&segs, base) {
            continue;
        }
        let rel = &segs[base.len()..];
        if rel.is_empty() {
            return Some(leaf);
        }
        set_in(&mut root, rel, leaf);
    }

    if root.is_null() { None } else { Some(root) }
}

/// Numeric ordering value of a child: the first listed field that holds a
/// number or numeric string, else 0.
pub fn order_value(child: &Value, fields: &[String]) -> i64 {
    fields
        .iter()
        .find_map(|f| match child.get(f)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|x| x as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}

/// Children of `node` selected and ordered by `query`.
pub fn apply_query(node: Option<&Value>, query: &ChildQuery) -> Vec<(String, Value)> {
    let Some(Value::Object(children)) = node else {
        return Vec::new();
    };

    let mut rows: Vec<(i64, &String, &Value)> = children
        .iter()
        .map(|(k, v)| (order_value(v, &query.order_by), k, v))
        .filter(|(order, key, _)| match &query.end_before {
            Some((bound, bound_key)) => (*order, key.as_str()) < (*bound, bound_key.as_str()),
            None => true,
        })
        .collect();
    rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let skip = match query.limit_to_last {
        Some(n) => rows.len().saturating_sub(n),
        None => 0,
    };

    rows.into_iter()
        .skip(skip)
        .map(|(_, k, v)| (k.clone(), v.clone()))
        .collect()
}

/// What a listener at a path (optionally narrowed by a query) sees.
pub fn snapshot(node: Option<&Value>, query: Option<&ChildQuery>) -> Snapshot {
    match query {
        None => node.cloned(),
        Some(q) => {
            let rows = apply_query(node, q);
            if rows.is_empty() {
                None
            } else {
                Some(Value::Object(rows.into_iter().collect()))
            }
        }
    }
}
