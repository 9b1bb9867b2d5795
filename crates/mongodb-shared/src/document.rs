//! Path based access into untyped JSON objects.
//!
//! The externally owned documents are deeply nested (`args2_6.net.ssl.mode`), these helpers
//! avoid spelling out every intermediate level at the call site.

use serde_json::{Map, Value};

/// Returns the value at `path`, or [`None`] if any segment is missing or not an object.
pub fn get_path<'a>(map: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (last, parents) = path.split_last()?;
    let mut current = map;
    for segment in parents {
        current = current.get(*segment)?.as_object()?;
    }
    current.get(*last)
}

/// Like [`get_path`], but only returns string values.
pub fn get_str<'a>(map: &'a Map<String, Value>, path: &[&str]) -> Option<&'a str> {
    get_path(map, path).and_then(Value::as_str)
}

/// Sets `value` at `path`, creating intermediate objects as needed.
///
/// Intermediate values that are not objects are replaced by objects.
pub fn set_path(map: &mut Map<String, Value>, path: &[&str], value: impl Into<Value>) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = map;
    for segment in parents {
        let entry = current
            .entry(*segment)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(child) => child,
            _ => return,
        };
    }
    current.insert((*last).to_owned(), value.into());
}

/// Removes and returns the value at `path`. Parents are left in place, even if they become empty.
pub fn remove_path(map: &mut Map<String, Value>, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = map;
    for segment in parents {
        current = current.get_mut(*segment)?.as_object_mut()?;
    }
    current.shift_remove(*last)
}

/// Renames `from` to `to` in place, keeping the key position. An existing `to` key is replaced.
pub fn rename_key(map: &mut Map<String, Value>, from: &str, to: &str) {
    if !map.contains_key(from) {
        return;
    }

    let renamed = std::mem::take(map)
        .into_iter()
        .filter(|(key, _)| key != to)
        .map(|(key, value)| {
            if key == from {
                (to.to_owned(), value)
            } else {
                (key, value)
            }
        })
        .collect();
    *map = renamed;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fixture() -> Map<String, Value> {
        json!({
            "net": {"port": 27017, "tls": {"mode": "requireTLS"}},
            "systemLog": {"destination": "file"},
        })
        .as_object()
        .cloned()
        .expect("fixture is an object")
    }

    #[test]
    fn get_nested_values() {
        let map = fixture();
        assert_eq!(get_path(&map, &["net", "port"]), Some(&json!(27017)));
        assert_eq!(get_str(&map, &["systemLog", "destination"]), Some("file"));
        assert_eq!(get_path(&map, &["net", "port", "nested"]), None);
        assert_eq!(get_path(&map, &[]), None);
    }

    #[test]
    fn set_creates_and_replaces_parents() {
        let mut map = fixture();
        set_path(&mut map, &["storage", "wiredTiger", "engineConfig", "cacheSizeGB"], 2.5);
        set_path(&mut map, &["systemLog", "destination", "path"], "/var/log");

        assert_eq!(
            get_path(&map, &["storage", "wiredTiger", "engineConfig", "cacheSizeGB"]),
            Some(&json!(2.5))
        );
        assert_eq!(
            get_path(&map, &["systemLog", "destination"]),
            Some(&json!({"path": "/var/log"}))
        );
    }

    #[test]
    fn remove_keeps_siblings() {
        let mut map = fixture();
        assert_eq!(
            remove_path(&mut map, &["net", "tls", "mode"]),
            Some(json!("requireTLS"))
        );
        assert_eq!(remove_path(&mut map, &["net", "missing"]), None);
        assert_eq!(get_path(&map, &["net", "port"]), Some(&json!(27017)));
        assert_eq!(get_path(&map, &["net", "tls"]), Some(&json!({})));
    }

    #[test]
    fn rename_keeps_position() {
        let mut net = fixture()
            .get("net")
            .and_then(Value::as_object)
            .cloned()
            .expect("net is an object");
        rename_key(&mut net, "tls", "ssl");

        assert_eq!(net.keys().collect::<Vec<_>>(), vec!["port", "ssl"]);
        assert_eq!(net.get("ssl"), Some(&json!({"mode": "requireTLS"})));
    }
}
