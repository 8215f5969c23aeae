use crate::http::RequestTarget;
use axum::body::{boxed, Bytes};
use axum::http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH};
use axum::response::Response;
use hyper::body::HttpBody;
use regex::bytes::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::error;

/// A body substitution: every match of `pattern` is replaced with `replacement`, which may refer to
/// groups of the pattern as `$1` or `${name}`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

/// Set `headers` on `response` and apply `replace` to its body.
///
/// Substitutions are applied chunk by chunk as the body streams, so a match spanning two chunks
/// is missed. A rewritten body has no known length, the response is sent without
/// `content-length` and with `connection: close`.
pub(super) fn apply(
    response: Response,
    headers: &BTreeMap<String, String>,
    replace: &[Replacement],
    target: &RequestTarget,
) -> Response {
    if headers.is_empty() && replace.is_empty() {
        return response;
    }
    let (mut parts, body) = response.into_parts();

    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                parts.headers.insert(name, value);
            }
            _ => error!(header = %name, "invalid response header"),
        }
    }
    if replace.is_empty() {
        return Response::from_parts(parts, body);
    }

    let rules: Vec<(Regex, Vec<u8>)> = replace
        .iter()
        .filter_map(|r| match Regex::new(&r.pattern) {
            Ok(pattern) => Some((pattern, expand(&r.replacement, target).into_bytes())),
            Err(err) => {
                error!(pattern = %r.pattern, "invalid replace pattern: {err}");
                None
            }
        })
        .collect();
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));

    let body = body.map_data(move |chunk: Bytes| {
        let mut data = chunk.to_vec();
        for (pattern, replacement) in &rules {
            data = pattern.replace_all(&data, replacement.as_slice()).into_owned();
        }
        Bytes::from(data)
    });
    Response::from_parts(parts, boxed(body))
}

fn expand(replacement: &str, target: &RequestTarget) -> String {
    replacement
        .replace("{hostname}", &target.host)
        .replace("{port}", &target.port.to_string())
        .replace("{path}", target.path())
        .replace("{scheme}", &target.scheme)
}
