use apexg_core::{TransformOp, TransformRule, TransformTarget};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::warn;

fn header_value(value: Option<&Value>) -> Option<HeaderValue> {
    let text = match value? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    HeaderValue::from_str(&text).ok()
}

fn apply_header(rule: &TransformRule, headers: &mut HeaderMap) {
    let Ok(name) = HeaderName::from_bytes(rule.path.as_bytes()) else {
        warn!(header = %rule.path, "invalid header name in transform rule");
        return;
    };
    match rule.op {
        TransformOp::Add => {
            if let Some(v) = header_value(rule.value.as_ref()) {
                headers.insert(name, v);
            }
        }
        TransformOp::Modify => {
            if headers.contains_key(&name) {
                if let Some(v) = header_value(rule.value.as_ref()) {
                    headers.insert(name, v);
                }
            }
        }
        TransformOp::Remove => {
            headers.remove(&name);
        }
        TransformOp::Rename => {
            let Some(to) = rule.to.as_deref().and_then(|t| HeaderName::from_bytes(t.as_bytes()).ok()) else {
                return;
            };
            let values: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
            headers.remove(&name);
            for v in values {
                headers.append(to.clone(), v);
            }
        }
    }
}

/// Walks to the object holding the last key, creating objects on the way when `create`.
fn parent_mut<'a>(root: &'a mut Map<String, Value>, path: &str, create: bool) -> Option<(&'a mut Map<String, Value>, String)> {
    let mut keys: Vec<&str> = path.split('.').collect();
    let last = keys.pop()?.to_string();
    let mut current = root;
    for key in keys {
        if create && !current.get(key).map(Value::is_object).unwrap_or(false) {
            current.insert(key.to_string(), Value::Object(Map::new()));
        }
        current = current.get_mut(key)?.as_object_mut()?;
    }
    Some((current, last))
}

fn apply_body(rule: &TransformRule, body: &mut Map<String, Value>) {
    match rule.op {
        TransformOp::Add => {
            if let Some((parent, key)) = parent_mut(body, &rule.path, true) {
                parent.insert(key, rule.value.clone().unwrap_or(Value::Null));
            }
        }
        TransformOp::Modify => {
            if let Some((parent, key)) = parent_mut(body, &rule.path, false) {
                if let Some(slot) = parent.get_mut(&key) {
                    *slot = rule.value.clone().unwrap_or(Value::Null);
                }
            }
        }
        TransformOp::Remove => {
            if let Some((parent, key)) = parent_mut(body, &rule.path, false) {
                parent.remove(&key);
            }
        }
        TransformOp::Rename => {
            let Some(to) = rule.to.as_deref() else { return };
            let taken = parent_mut(body, &rule.path, false).and_then(|(parent, key)| parent.remove(&key));
            if let Some(value) = taken {
                if let Some((parent, key)) = parent_mut(body, to, true) {
                    parent.insert(key, value);
                }
            }
        }
    }
}

/// Applies rules in order. Body rules only touch JSON object bodies.
pub fn apply(rules: &[TransformRule], headers: &mut HeaderMap, body: &mut Bytes) {
    if rules.is_empty() {
        return;
    }
    let mut json: Option<Map<String, Value>> = None;
    let wants_body = rules.iter().any(|r| r.target == TransformTarget::Body);
    if wants_body {
        json = serde_json::from_slice::<Value>(body).ok().and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        });
    }

    for rule in rules {
        match rule.target {
            TransformTarget::Header => apply_header(rule, headers),
            TransformTarget::Body => {
                if let Some(map) = json.as_mut() {
                    apply_body(rule, map);
                }
            }
        }
    }

    if let Some(map) = json {
        match serde_json::to_vec(&Value::Object(map)) {
            Ok(bytes) => {
                *body = Bytes::from(bytes);
                headers.remove(http::header::CONTENT_LENGTH);
            }
            Err(e) => warn!(error = %e, "transformed body not serializable"),
        }
    }
}
