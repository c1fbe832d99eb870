// JSON traversal over the config tree: the admin path after `/config/`
// addresses a subtree, and each HTTP verb maps to one mutation.

use axum::http::Method;
use serde_json::Value;

use super::AdminError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::POST => Some(Verb::Post),
            Method::PUT => Some(Verb::Put),
            Method::PATCH => Some(Verb::Patch),
            Method::DELETE => Some(Verb::Delete),
            _ => None,
        }
    }
}

/// Parses an array index segment: `3` or `[3]`.
fn parse_index(segment: &str) -> Option<usize> {
    let inner = segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(segment);
    inner.parse().ok()
}

fn descend<'a>(node: &'a Value, segment: &str) -> Result<&'a Value, AdminError> {
    match node {
        Value::Object(map) => map
            .get(segment)
            .ok_or_else(|| AdminError::NotFound(format!("unknown config key {segment:?}"))),
        Value::Array(items) => {
            let index = parse_index(segment).ok_or_else(|| {
                AdminError::BadRequest(format!("array index expected, got {segment:?}"))
            })?;
            items
                .get(index)
                .ok_or_else(|| AdminError::NotFound(format!("array index {index} out of range")))
        }
        _ => Err(AdminError::NotFound(format!(
            "cannot traverse into scalar at {segment:?}"
        ))),
    }
}

fn descend_mut<'a>(node: &'a mut Value, segment: &str) -> Result<&'a mut Value, AdminError> {
    match node {
        Value::Object(map) => map
            .get_mut(segment)
            .ok_or_else(|| AdminError::NotFound(format!("unknown config key {segment:?}"))),
        Value::Array(items) => {
            let index = parse_index(segment).ok_or_else(|| {
                AdminError::BadRequest(format!("array index expected, got {segment:?}"))
            })?;
            let len = items.len();
            items.get_mut(index).ok_or_else(|| {
                AdminError::NotFound(format!("array index {index} out of range (len {len})"))
            })
        }
        _ => Err(AdminError::NotFound(format!(
            "cannot traverse into scalar at {segment:?}"
        ))),
    }
}

/// Returns the subtree at `path`.
pub fn get<'a>(doc: &'a Value, path: &[String]) -> Result<&'a Value, AdminError> {
    let mut node = doc;
    for segment in path {
        node = descend(node, segment)?;
    }
    Ok(node)
}

/// Applies one mutation at `path`.
///
/// POST appends to an array or inserts a new map entry; PUT replaces the
/// addressed subtree (array indices must exist); PATCH is an RFC 7386
/// merge; DELETE removes (array deletes shift left).
pub fn apply(
    doc: &mut Value,
    path: &[String],
    verb: Verb,
    body: Option<Value>,
) -> Result<(), AdminError> {
    let need_body = || {
        body.clone()
            .ok_or_else(|| AdminError::BadRequest("request body required".to_string()))
    };

    // Root-level operations have no parent to navigate to.
    if path.is_empty() {
        match verb {
            Verb::Put => *doc = need_body()?,
            Verb::Patch => json_patch::merge(doc, &need_body()?),
            Verb::Delete => *doc = Value::Object(serde_json::Map::new()),
            Verb::Post => {
                return Err(AdminError::BadRequest(
                    "POST requires a target key or array".to_string(),
                ))
            }
        }
        return Ok(());
    }

    let (last, parents) = path.split_last().expect("non-empty path");
    let mut parent = doc;
    for segment in parents {
        parent = descend_mut(parent, segment)?;
    }

    match verb {
        Verb::Post => {
            let body = need_body()?;
            // Appending to an existing array wins; otherwise the last
            // segment names a fresh entry in the parent map.
            match parent {
                Value::Object(map) => match map.get_mut(last.as_str()) {
                    Some(Value::Array(items)) => items.push(body),
                    Some(_) => {
                        return Err(AdminError::BadRequest(format!(
                            "config key {last:?} already exists"
                        )))
                    }
                    None => {
                        map.insert(last.clone(), body);
                    }
                },
                Value::Array(_) => {
                    let target = descend_mut(parent, last)?;
                    match target {
                        Value::Array(items) => items.push(body),
                        _ => {
                            return Err(AdminError::BadRequest(
                                "POST target is not an array".to_string(),
                            ))
                        }
                    }
                }
                _ => {
                    return Err(AdminError::NotFound(
                        "cannot traverse into scalar".to_string(),
                    ))
                }
            }
        }
        Verb::Put => match parent {
            Value::Object(map) => {
                map.insert(last.clone(), need_body()?);
            }
            Value::Array(_) => {
                let slot = descend_mut(parent, last)?;
                *slot = need_body()?;
            }
            _ => {
                return Err(AdminError::NotFound(
                    "cannot traverse into scalar".to_string(),
                ))
            }
        },
        Verb::Patch => {
            let target = descend_mut(parent, last)?;
            json_patch::merge(target, &need_body()?);
        }
        Verb::Delete => match parent {
            Value::Object(map) => {
                map.remove(last.as_str()).ok_or_else(|| {
                    AdminError::NotFound(format!("unknown config key {last:?}"))
                })?;
            }
            Value::Array(items) => {
                let index = parse_index(last).ok_or_else(|| {
                    AdminError::BadRequest(format!("array index expected, got {last:?}"))
                })?;
                if index >= items.len() {
                    return Err(AdminError::NotFound(format!(
                        "array index {index} out of range"
                    )));
                }
                items.remove(index);
            }
            _ => {
                return Err(AdminError::NotFound(
                    "cannot traverse into scalar".to_string(),
                ))
            }
        },
    }

    Ok(())
}
