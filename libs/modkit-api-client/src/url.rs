//! URL composition: `:name` path templates, flattened query strings and cache keys.

use crate::error::ApiError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use url::Url;

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("static regex should not panic")
});

/// Text form of a scalar used in paths, queries and form fields.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `:name` placeholder in `template` with the percent-encoded param value.
///
/// # Errors
/// Returns `ApiError::MissingParameter` when a placeholder has no value or a
/// `null` value.
pub fn substitute_path(template: &str, params: &Map<String, Value>) -> Result<String, ApiError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = match params.get(name.as_str()) {
            Some(Value::Null) | None => {
                return Err(ApiError::MissingParameter {
                    name: name.as_str().to_owned(),
                    path: template.to_owned(),
                });
            }
            Some(value) => value,
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&urlencoding::encode(&value_text(value)));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Flatten a query map into ordered pairs.
///
/// Keys are visited in sorted order so the result does not depend on how the
/// caller built the map. Nested objects render as `outer[inner]`, arrays add
/// one pair per element, `null` entries are skipped.
#[must_use]
pub fn flatten_query(query: &Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut keys: Vec<&String> = query.keys().collect();
    keys.sort();
    for key in keys {
        flatten_into(key, &query[key.as_str()], &mut pairs);
    }
    pairs
}

fn flatten_into(key: &str, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                flatten_into(key, item, pairs);
            }
        }
        Value::Object(map) => {
            let mut inner: Vec<&String> = map.keys().collect();
            inner.sort();
            for name in inner {
                flatten_into(&format!("{key}[{name}]"), &map[name.as_str()], pairs);
            }
        }
        scalar => pairs.push((key.to_owned(), value_text(scalar))),
    }
}

/// Cache key for a call: `base` (override key or substituted path) plus the
/// flattened query as an unencoded `?k=v&...` suffix.
#[must_use]
pub fn cache_key(base: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return base.to_owned();
    }
    let suffix = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{suffix}")
}

/// Parse and validate the client's base address.
///
/// # Errors
/// Returns `ApiError::Configuration` if `raw` is not an absolute URL with a host.
pub fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw)
        .map_err(|e| ApiError::configuration(format!("base URL '{raw}' is malformed: {e}")))?;
    if url.cannot_be_a_base() || !url.has_host() {
        return Err(ApiError::configuration(format!(
            "base URL '{raw}' must be an absolute URL with a host"
        )));
    }
    Ok(url)
}

/// Join `path` onto `base` by concatenation, keeping any base path prefix.
fn join_path(base: &Url, path: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    if path.is_empty() || path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Final request URL: base + substituted path + query pairs.
///
/// # Errors
/// Returns `ApiError::Configuration` if the joined string does not parse.
pub fn build_url(base: &Url, path: &str, query: &[(String, String)]) -> Result<Url, ApiError> {
    let joined = join_path(base, path);
    let mut url = Url::parse(&joined)
        .map_err(|e| ApiError::configuration(format!("request URL '{joined}' is invalid: {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

/// Socket address for a route: base + template path with `http(s)` rewritten to `ws(s)`.
///
/// The template is used verbatim; params and query are not substituted here.
#[must_use]
pub fn socket_address(base: &Url, path: &str) -> String {
    let joined = join_path(base, path);
    if let Some(rest) = joined.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = joined.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        joined
    }
}
