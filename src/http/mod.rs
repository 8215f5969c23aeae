//! Descriptor driven HTTP(S) server.
//!
//! Each request is matched against descriptors with `"protocol": "http"` using three candidate
//! strings, in priority order: the reconstructed URL (`http://example.com:8080/a?b=c`), the path
//! and query (`/a?b=c`, only when there is a query) and the path (`/a`). The first descriptor
//! whose action `method` (default: any) agrees with the request handles it.
//!
//! # Handlers
//!
//! The action's `handler` (default `serve`) decides how the response is produced:
//!
//! * `raw` - `code` (default 200) and a literal `body`.
//!   ```json
//!   { "protocol": "http", "route": "^/raw$", "action": { "handler": "raw", "code": 202, "body": "OK" } }
//!   ```
//! * `serve` - the file at `path` below the files root, with `code` (default 200). Paths that
//!   resolve outside of the root are not found. When `path` isn't a file, the closest
//!   `index.plugin` in it or an ancestor directory (up to the root) handles the request instead.
//!   Plugin units are run rather than served.
//!   ```json
//!   { "protocol": "http", "route": "^/static/(.*)$", "action": { "path": "wwwroot/$1" } }
//!   ```
//! * `script` - the plugin unit at `path`. The unit sees `base` as its mount point and the rest
//!   of the request path below it; `rewrite` is a pattern searched in the request path whose
//!   first group (or whole match) replaces that residual path.
//!   ```json
//!   { "protocol": "http", "route": "^/api/", "action": { "handler": "script", "path": "scripts/echo.plugin", "base": "/api" } }
//!   ```
//! * `forward` - proxy to `destination`. With `recreate_url` (default true) only the scheme and
//!   authority of `destination` are kept and the request's path and query are appended.
//!   `request_headers` are added to the upstream request.
//!   ```json
//!   { "protocol": "http", "route": "^/proxy", "action": { "handler": "forward", "destination": "http://upstream.test" } }
//!   ```
//!
//! Whatever the handler, `headers` are set on the response, and `replace` applies
//! `{"pattern", "replacement"}` byte regex substitutions to each chunk of the response body.
//! `{hostname}`, `{port}`, `{path}` and `{scheme}` in a replacement are expanded first.
//!
//! # Placeholders
//!
//! Action strings may use `{{url}}`, `{{scheme}}`, `{{hostname}}`, `{{port}}`, `{{path}}` and
//! `{{query}}`, plus `$N` and named groups of the descriptor's `route` as matched against the
//! winning candidate.
//!
//! Descriptors with `"protocol": "http_middleware"` matching any of the candidates wrap the
//! handler, see [`crate::middleware`]. A request with no matching descriptor gets `404 Not Found`.

mod forward;
mod handlers;
mod resolver;
mod rewrite;
pub mod server;

pub use forward::Forwarder;
pub use handlers::{HandlerName, HttpAction};
pub use resolver::Dispatcher;
pub use rewrite::Replacement;
pub use server::new;

use crate::error::Error;
use crate::middleware::{MiddlewareFn, Next};
use crate::store::Match;
use axum::body::Body;
use axum::http::uri::Authority;
use axum::http::{header, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;

/// The parts of a request that descriptors are matched and expanded against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Origin form, path and query only.
    pub uri: Uri,
}

impl RequestTarget {
    /// Describe a request received on a listener bound to `port`.
    pub fn from_request(request: &Request<Body>, secure: bool, port: u16) -> Self {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok())
            .map(|a| a.host().to_string())
            .or_else(|| request.uri().host().map(str::to_string))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "-".to_string());
        let uri = request
            .uri()
            .path_and_query()
            .and_then(|pq| pq.as_str().parse().ok())
            .unwrap_or_else(|| Uri::from_static("/"));
        RequestTarget {
            method: request.method().clone(),
            scheme: if secure { "https" } else { "http" }.to_string(),
            host,
            port,
            uri,
        }
    }

    /// Describe an absolute `http://` or `https://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` doesn't parse, has another scheme, or has no host.
    pub fn parse(method: Method, url: &str) -> Result<Self, Error> {
        let parsed: Uri = url
            .parse()
            .map_err(|err| Error::InvalidUrl(format!("{url}: {err}")))?;
        let scheme = match parsed.scheme_str() {
            Some(s @ ("http" | "https")) => s.to_string(),
            other => {
                return Err(Error::InvalidUrl(format!(
                    "unrecognised scheme {:?} in {url}",
                    other.unwrap_or_default()
                )))
            }
        };
        let host = parsed
            .host()
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: no host")))?
            .to_string();
        let port = parsed.port_u16().unwrap_or(default_port(&scheme));
        let uri = parsed
            .path_and_query()
            .and_then(|pq| pq.as_str().parse().ok())
            .unwrap_or_else(|| Uri::from_static("/"));
        Ok(RequestTarget {
            method,
            scheme,
            host,
            port,
            uri,
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }

    /// The reconstructed URL. The port is omitted when it's the scheme's default.
    pub fn url(&self) -> String {
        let port = if self.port == default_port(&self.scheme) {
            String::new()
        } else {
            format!(":{}", self.port)
        };
        format!(
            "{}://{}{}{}",
            self.scheme,
            self.host,
            port,
            self.path_and_query()
        )
    }

    /// The strings descriptors are matched against, highest priority first.
    pub fn candidates(&self) -> Vec<String> {
        let mut candidates = vec![self.url()];
        if self.query().map_or(false, |q| !q.is_empty()) {
            candidates.push(self.path_and_query().to_string());
        }
        candidates.push(self.path().to_string());
        candidates
    }

    /// Request derived template variables.
    pub fn variables(&self) -> Vec<(&'static str, String)> {
        vec![
            ("url", self.url()),
            ("scheme", self.scheme.clone()),
            ("hostname", self.host.clone()),
            ("port", self.port.to_string()),
            ("path", self.path().to_string()),
            ("query", self.query().unwrap_or_default().to_string()),
        ]
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// The unit of work passed through HTTP middleware.
#[derive(Debug)]
pub struct Exchange {
    pub request: Request<Body>,
    pub target: RequestTarget,
    pub matched: Option<Match>,
}

pub type HttpNext = Next<Exchange, BoxFuture<'static, Response>>;
pub type HttpMiddleware = MiddlewareFn<Exchange, BoxFuture<'static, Response>>;

/// The response for requests nothing handles.
pub fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub(crate) fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_in_priority_order() {
        let request = Request::builder()
            .uri("/a/b?x=1")
            .header(header::HOST, "Example.com:8080")
            .body(Body::empty())
            .unwrap();
        let target = RequestTarget::from_request(&request, false, 8080);
        assert_eq!(target.host, "Example.com");
        assert_eq!(
            target.candidates(),
            vec!["http://Example.com:8080/a/b?x=1", "/a/b?x=1", "/a/b"]
        );

        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let target = RequestTarget::from_request(&request, true, 443);
        assert_eq!(target.candidates(), vec!["https://example.com/", "/"]);
    }

    #[test]
    fn parse_urls() {
        let target = RequestTarget::parse(Method::GET, "http://example.com/proxy?x=1").unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.path_and_query(), "/proxy?x=1");
        assert_eq!(target.url(), "http://example.com/proxy?x=1");

        let target = RequestTarget::parse(Method::POST, "https://[::1]:8443").unwrap();
        assert_eq!(target.port, 8443);
        assert_eq!(target.url(), "https://[::1]:8443/");

        assert!(RequestTarget::parse(Method::GET, "ftp://example.com/").is_err());
        assert!(RequestTarget::parse(Method::GET, "/relative").is_err());
    }

    #[test]
    fn missing_host() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let target = RequestTarget::from_request(&request, false, 80);
        assert_eq!(target.url(), "http://-/");
        let vars = target.variables();
        assert!(vars.contains(&("port", "80".to_string())));
        assert!(vars.contains(&("query", String::new())));
    }
}
