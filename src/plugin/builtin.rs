//! Plugins shipped with the server.
//!
//! | name          | provides                                                           |
//! |---------------|--------------------------------------------------------------------|
//! | `echo`        | app describing the request it received as JSON                     |
//! | `arguments`   | resource reporting its `args`/`kwargs` in `x-args`/`x-kwargs`      |
//! | `round_robin` | DNS records cycling through `options.values`                       |
//! | `logger`      | `dns_log`, `http_log` and `ssl_log` middleware                     |
//! | `delay`       | `dns_delay` and `http_delay` middleware sleeping `kwargs.duration` |
//! | `certificate` | `select` ssl middleware returning `options.certificate`/`key`      |

use crate::dns::{DnsMiddleware, DnsNext, Lookup, Sections};
use crate::error::Error;
use crate::http::{Exchange, HttpMiddleware, HttpNext};
use crate::plugin::{
    App, Arguments, Plugin, PluginRegistry, RecordSource, Resource, ResourceFactory,
    ScriptRequest,
};
use crate::sandbox;
use crate::tls::{self, SslMiddleware, SslNext};
use anyhow::{anyhow, Context as _};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use rustls::sign::CertifiedKey;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;
use trust_dns_proto::rr::{DNSClass, RecordType};

lazy_static! {
    static ref TIMESTAMP: &'static [FormatItem<'static>] =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
}

impl PluginRegistry {
    /// A registry holding every built-in plugin.
    pub fn builtin() -> Self {
        let mut registry = PluginRegistry::default();
        registry
            .register("echo", |_, _| Ok(Arc::new(Echo)))
            .register("arguments", |_, _| Ok(Arc::new(ArgumentsReport)))
            .register("round_robin", |options, _| Ok(Arc::new(RoundRobin::new(options)?)))
            .register("logger", |_, _| Ok(Arc::new(Logger)))
            .register("delay", |_, _| Ok(Arc::new(Delay)))
            .register("certificate", |options, root| {
                Ok(Arc::new(FixedCertificate::new(options, root)?))
            });
        registry
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&TIMESTAMP)
        .unwrap_or_default()
}

struct Echo;

#[async_trait::async_trait]
impl App for Echo {
    async fn call(&self, request: ScriptRequest) -> anyhow::Result<Response> {
        let headers: Map<String, Value> = request
            .request
            .headers()
            .iter()
            .map(|(name, value)| {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                (name.to_string(), Value::String(value))
            })
            .collect();
        Ok(Json(json!({
            "method": request.request.method().as_str(),
            "uri": request.target.url(),
            "base": request.base,
            "path": request.path,
            "headers": headers,
        }))
        .into_response())
    }
}

impl Plugin for Echo {
    fn app(&self) -> Option<&dyn App> {
        Some(self)
    }
}

struct ArgumentsReport;

struct ArgumentsResource(Arguments);

impl ResourceFactory for ArgumentsReport {
    fn get_resource(
        &self,
        _request: &ScriptRequest,
        args: &Arguments,
    ) -> anyhow::Result<Box<dyn Resource>> {
        Ok(Box::new(ArgumentsResource(args.clone())))
    }
}

impl Resource for ArgumentsResource {
    fn render(self: Box<Self>, _request: ScriptRequest) -> BoxFuture<'static, anyhow::Result<Response>> {
        Box::pin(async move {
            let args = HeaderValue::from_str(&serde_json::to_string(&self.0.args)?)?;
            let kwargs = HeaderValue::from_str(&serde_json::to_string(&self.0.kwargs)?)?;
            let mut response = "OK".into_response();
            response.headers_mut().insert("x-args", args);
            response.headers_mut().insert("x-kwargs", kwargs);
            Ok(response)
        })
    }
}

impl Plugin for ArgumentsReport {
    fn resource(&self) -> Option<&dyn ResourceFactory> {
        Some(self)
    }
}

#[derive(Deserialize)]
struct RoundRobinOptions {
    values: Vec<Value>,
}

/// Answers each query with the next of its values.
struct RoundRobin {
    values: Vec<Value>,
    next: AtomicUsize,
}

impl RoundRobin {
    fn new(options: &Value) -> anyhow::Result<Self> {
        let options = RoundRobinOptions::deserialize(options).context("round_robin options")?;
        if options.values.is_empty() {
            return Err(anyhow!("round_robin needs at least one value"));
        }
        Ok(RoundRobin {
            values: options.values,
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl RecordSource for RoundRobin {
    async fn get_record(
        &self,
        _name: &str,
        _class: DNSClass,
        _rtype: RecordType,
        _args: &Arguments,
    ) -> anyhow::Result<Value> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.values.len();
        Ok(self.values[i].clone())
    }
}

impl Plugin for RoundRobin {
    fn record(&self) -> Option<&dyn RecordSource> {
        Some(self)
    }
}

/// Access log middleware.
struct Logger;

impl Plugin for Logger {
    fn dns_middleware(&self, function: &str) -> Option<DnsMiddleware> {
        if function != "dns_log" {
            return None;
        }
        Some(Arc::new(
            |next: DnsNext, lookup: Lookup, _: &Arguments| -> BoxFuture<'static, Sections> {
                let query = lookup.query.clone();
                let started = Instant::now();
                Box::pin(async move {
                    let sections = next(lookup).await;
                    info!(
                        timestamp = %timestamp(),
                        name = %query.name,
                        class = %query.class,
                        rtype = %query.rtype,
                        src = ?query.src,
                        records = sections.len(),
                        elapsed = ?started.elapsed(),
                        "dns"
                    );
                    sections
                })
            },
        ))
    }

    fn http_middleware(&self, function: &str) -> Option<HttpMiddleware> {
        if function != "http_log" {
            return None;
        }
        Some(Arc::new(
            |next: HttpNext, exchange: Exchange, _: &Arguments| -> BoxFuture<'static, Response> {
                let method = exchange.target.method.clone();
                let url = exchange.target.url();
                let started = Instant::now();
                Box::pin(async move {
                    let response = next(exchange).await;
                    info!(
                        timestamp = %timestamp(),
                        %method,
                        %url,
                        status = response.status().as_u16(),
                        elapsed = ?started.elapsed(),
                        "http"
                    );
                    response
                })
            },
        ))
    }

    fn ssl_middleware(&self, function: &str) -> Option<SslMiddleware> {
        if function != "ssl_log" {
            return None;
        }
        Some(Arc::new(|next: SslNext, server_name: String, _: &Arguments| {
            info!(timestamp = %timestamp(), %server_name, "ssl");
            next(server_name)
        }))
    }
}

/// Middleware holding requests back for `kwargs.duration` seconds (default 1).
struct Delay;

fn delay_of(args: &Arguments) -> Duration {
    let seconds = args
        .kwarg("duration")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    Duration::try_from_secs_f64(seconds).unwrap_or_default()
}

impl Plugin for Delay {
    fn dns_middleware(&self, function: &str) -> Option<DnsMiddleware> {
        if function != "dns_delay" {
            return None;
        }
        Some(Arc::new(
            |next: DnsNext, lookup: Lookup, args: &Arguments| -> BoxFuture<'static, Sections> {
                let delay = delay_of(args);
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    next(lookup).await
                })
            },
        ))
    }

    fn http_middleware(&self, function: &str) -> Option<HttpMiddleware> {
        if function != "http_delay" {
            return None;
        }
        Some(Arc::new(
            |next: HttpNext, exchange: Exchange, args: &Arguments| -> BoxFuture<'static, Response> {
                let delay = delay_of(args);
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    next(exchange).await
                })
            },
        ))
    }
}

#[derive(Deserialize)]
struct CertificateOptions {
    certificate: String,
    key: Option<String>,
}

/// Serves an alternate certificate to the server names its descriptor matches.
struct FixedCertificate(Arc<CertifiedKey>);

impl FixedCertificate {
    fn new(options: &Value, root: &Path) -> anyhow::Result<Self> {
        let options = CertificateOptions::deserialize(options).context("certificate options")?;
        let certificate = sandbox::contain(root, &options.certificate)
            .ok_or_else(|| Error::SandboxEscape(options.certificate.clone().into()))?;
        let key = match options.key {
            Some(key) => sandbox::contain(root, &key).ok_or(Error::SandboxEscape(key.into()))?,
            None => certificate.clone(),
        };
        Ok(FixedCertificate(tls::load_certified_key(&certificate, &key)?))
    }
}

impl Plugin for FixedCertificate {
    fn ssl_middleware(&self, function: &str) -> Option<SslMiddleware> {
        if function != "select" {
            return None;
        }
        let key = self.0.clone();
        Some(Arc::new(move |_: SslNext, _: String, _: &Arguments| key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsQuery;
    use crate::http::RequestTarget;
    use crate::plugin::{Handler, PluginLoader};
    use crate::tls::tests::testdata;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use std::fs;
    use tempfile::TempDir;
    use trust_dns_proto::rr::Name;

    fn script_request(url: &str) -> ScriptRequest {
        let target = RequestTarget::parse(Method::GET, url).unwrap();
        let request = Request::builder()
            .uri(target.path_and_query())
            .header("x-test", "1")
            .body(Body::empty())
            .unwrap();
        ScriptRequest {
            request,
            target,
            base: "/api".into(),
            path: "/items".into(),
        }
    }

    async fn body(response: Response) -> Vec<u8> {
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec()
    }

    fn lookup() -> Lookup {
        Lookup {
            query: DnsQuery::new(
                Name::from_ascii("example.com.").unwrap(),
                DNSClass::IN,
                RecordType::A,
                None,
            ),
            matched: None,
        }
    }

    fn authoritative(_: Lookup) -> BoxFuture<'static, Sections> {
        Box::pin(async {
            Sections {
                authoritative: true,
                ..Sections::default()
            }
        })
    }

    #[tokio::test]
    async fn echo_describes_request() {
        let response = Echo.call(script_request("http://example.com/api/items?x=1")).await.unwrap();
        let echoed: Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["uri"], "http://example.com/api/items?x=1");
        assert_eq!(echoed["base"], "/api");
        assert_eq!(echoed["path"], "/items");
        assert_eq!(echoed["headers"]["x-test"], "1");
    }

    #[tokio::test]
    async fn arguments_are_reported_in_headers() {
        let args: Arguments =
            serde_json::from_value(json!({"args": [1, "two"], "kwargs": {"k": "v"}})).unwrap();
        let request = script_request("http://example.com/");
        let resource = ArgumentsReport.get_resource(&request, &args).unwrap();
        let response = resource.render(request).await.unwrap();
        assert_eq!(response.headers()["x-args"], r#"[1,"two"]"#);
        assert_eq!(response.headers()["x-kwargs"], r#"{"k":"v"}"#);
        assert_eq!(body(response).await, b"OK");
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let source = RoundRobin::new(&json!({"values": ["10.0.0.1", "10.0.0.2"]})).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let value = source
                .get_record("example.com", DNSClass::IN, RecordType::A, &Arguments::default())
                .await
                .unwrap();
            seen.push(value);
        }
        assert_eq!(seen, vec![json!("10.0.0.1"), json!("10.0.0.2"), json!("10.0.0.1")]);

        assert!(RoundRobin::new(&json!({"values": []})).is_err());
        assert!(RoundRobin::new(&Value::Null).is_err());
    }

    #[tokio::test]
    async fn logger_passes_through() {
        let log = Logger.dns_middleware("dns_log").unwrap();
        let sections = log(Arc::new(authoritative), lookup(), &Arguments::default()).await;
        assert!(sections.authoritative);

        assert!(Logger.http_middleware("http_log").is_some());
        assert!(Logger.ssl_middleware("ssl_log").is_some());
        assert!(Logger.dns_middleware("http_log").is_none());
    }

    #[tokio::test]
    async fn delay_holds_requests() {
        let delay = Delay.dns_middleware("dns_delay").unwrap();
        let args: Arguments = serde_json::from_value(json!({"kwargs": {"duration": 0.05}})).unwrap();
        let started = Instant::now();
        let sections = delay(Arc::new(authoritative), lookup(), &args).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(sections.authoritative);

        let args: Arguments = serde_json::from_value(json!({"kwargs": {"duration": -1}})).unwrap();
        assert_eq!(delay_of(&args), Duration::ZERO);
    }

    #[test]
    fn certificate_units_stay_in_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("files");
        fs::create_dir_all(&root).unwrap();
        fs::copy(testdata("alt.pem"), dir.path().join("alt.pem")).unwrap();
        fs::copy(testdata("alt.pem"), root.join("alt.pem")).unwrap();
        fs::copy(testdata("alt.key"), root.join("alt.key")).unwrap();
        fs::write(
            root.join("outside.plugin"),
            r#"{"plugin": "certificate", "options": {"certificate": "../alt.pem", "key": "alt.key"}}"#,
        )
        .unwrap();
        fs::write(
            root.join("inside.plugin"),
            r#"{"plugin": "certificate", "options": {"certificate": "alt.pem", "key": "alt.key"}}"#,
        )
        .unwrap();
        let loader = PluginLoader::new(&root, PluginRegistry::builtin()).unwrap();

        assert!(matches!(loader.load("outside.plugin"), Err(Error::Plugin { .. })));
        let unit = loader.load("inside.plugin").unwrap();
        assert!(unit.plugin().ssl_middleware("select").is_some());
        assert!(unit.handler().is_none());
    }

    #[test]
    fn registry_contents() {
        let registry = PluginRegistry::builtin();
        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(
            names,
            ["arguments", "certificate", "delay", "echo", "logger", "round_robin"]
        );
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("echo.plugin"), r#"{"plugin": "echo"}"#).unwrap();
        let loader = PluginLoader::new(dir.path(), registry).unwrap();
        assert!(matches!(
            loader.load("echo.plugin").unwrap().handler(),
            Some(Handler::App(_))
        ));
    }
}
