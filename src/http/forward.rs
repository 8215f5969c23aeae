use crate::config::Config;
use crate::error::Error;
use crate::http::RequestTarget;
use axum::body::{boxed, Body, Full};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::Client;
use hyper_rustls::HttpsConnector;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error};

/// Request headers never passed upstream.
const STRIPPED: [&str; 12] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
    "content-length",
    "host",
    "transfer-encoding",
    "accept-encoding",
];

/// Reverse proxies requests for the `forward` handler.
///
/// Every exchange is bounded by a deadline covering both the response head and the body. Once the
/// head has arrived, whatever part of the body arrives before the deadline, the upstream closing
/// the connection or the byte cap is returned.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    timeout: Duration,
    max_bytes: Option<usize>,
}

impl Forwarder {
    pub fn new(timeout: Duration, max_bytes: Option<usize>) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Forwarder {
            client: Client::builder().pool_max_idle_per_host(0).build(connector),
            timeout,
            max_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.forward_timeout, config.forward_max_bytes)
    }

    /// The upstream URL: `destination` as given, or its scheme and authority followed by the
    /// request's path and query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `destination` isn't an absolute URL.
    pub fn upstream_url(
        destination: &str,
        target: &RequestTarget,
        recreate_url: bool,
    ) -> Result<Uri, Error> {
        let destination: Uri = destination
            .parse()
            .map_err(|err| Error::InvalidUrl(format!("{destination}: {err}")))?;
        if !recreate_url {
            return Ok(destination);
        }
        let (Some(scheme), Some(authority)) = (destination.scheme(), destination.authority())
        else {
            return Err(Error::InvalidUrl(format!(
                "{destination}: expected scheme and host"
            )));
        };
        Uri::builder()
            .scheme(scheme.clone())
            .authority(authority.clone())
            .path_and_query(target.path_and_query())
            .build()
            .map_err(|err| Error::InvalidUrl(err.to_string()))
    }

    pub async fn forward(
        &self,
        request: Request<Body>,
        upstream: Uri,
        request_headers: &BTreeMap<String, String>,
    ) -> Response {
        let deadline = Instant::now() + self.timeout;
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        for name in STRIPPED {
            headers.remove(name);
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        for (name, value) in request_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => error!(header = %name, "invalid request header"),
            }
        }

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = upstream.clone();
        *outbound.headers_mut() = headers;

        debug!(%upstream, "forwarding request");
        let response = match timeout_at(deadline, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return upstream_error(&upstream, &err),
            Err(_) => {
                let reason = format!("timed out after {:?}", self.timeout);
                return upstream_error(&upstream, &reason);
            }
        };

        let (mut parts, mut body) = response.into_parts();
        let mut collected: Vec<u8> = Vec::new();
        loop {
            match timeout_at(deadline, body.data()).await {
                Ok(Some(Ok(chunk))) => {
                    collected.extend_from_slice(&chunk);
                    if let Some(max) = self.max_bytes {
                        if collected.len() >= max {
                            collected.truncate(max);
                            debug!(%upstream, max, "partial download, byte limit reached");
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    debug!(%upstream, "partial download: {err}");
                    break;
                }
                Err(_) => {
                    debug!(%upstream, "partial download: timed out");
                    break;
                }
            }
        }

        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts.headers.remove(header::CONNECTION);
        Response::from_parts(parts, boxed(Full::from(collected)))
    }
}

fn upstream_error(upstream: &Uri, err: &dyn fmt::Display) -> Response {
    let err = Error::Upstream(err.to_string());
    error!(%upstream, "{err}");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("timeout", &self.timeout)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}
