//! Plugin units.
//!
//! Descriptors refer to behaviour that isn't expressible as data (script-backed HTTP responses,
//! computed DNS records, middleware) through *plugin units*: small JSON manifests under the
//! files root, with the `.plugin` extension, naming a registered [`Plugin`] and its options.
//!
//! ```json
//! { "plugin": "round_robin", "options": { "values": ["{{ipv4_address}}", "127.0.0.1"] } }
//! ```
//!
//! A unit is constructed once per modification time of its manifest and cached by absolute
//! path, see [`PluginLoader`]. What a unit can do is discovered by probing the [`Plugin`]
//! entry points:
//!
//! * [`Plugin::app`] - handles a whole HTTP request.
//! * [`Plugin::resource`] - builds a per-request [`Resource`] which renders the response.
//! * [`Plugin::record`] - produces DNS response values for a `script` action.
//! * [`Plugin::dns_middleware`], [`Plugin::http_middleware`], [`Plugin::ssl_middleware`] - named
//!   middleware functions, see [`crate::middleware`].

pub mod builtin;
mod loader;

pub use loader::{PluginFactory, PluginLoader, PluginRegistry, PluginUnit, INDEX_UNIT, UNIT_EXTENSION};

use crate::dns::DnsMiddleware;
use crate::http::{HttpMiddleware, RequestTarget};
use crate::tls::SslMiddleware;
use axum::body::Body;
use axum::response::Response;
use futures::future::BoxFuture;
use hyper::Request;
use serde::Deserialize;
use serde_json::{Map, Value};
use trust_dns_proto::rr::{DNSClass, RecordType};

/// Fixed positional and keyword arguments taken from an action's `args` and `kwargs`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// The request handed to an HTTP plugin.
///
/// `base` is where the unit is mounted and `path` the residual path below it, after any
/// `base`/`rewrite` relocation performed by the `script` handler.
#[derive(Debug)]
pub struct ScriptRequest {
    pub request: Request<Body>,
    pub target: RequestTarget,
    pub base: String,
    pub path: String,
}

/// A unit that handles complete HTTP requests.
#[async_trait::async_trait]
pub trait App: Send + Sync {
    async fn call(&self, request: ScriptRequest) -> anyhow::Result<Response>;
}

/// A unit that builds a [`Resource`] per request.
pub trait ResourceFactory: Send + Sync {
    fn get_resource(
        &self,
        request: &ScriptRequest,
        args: &Arguments,
    ) -> anyhow::Result<Box<dyn Resource>>;
}

pub trait Resource: Send {
    fn render(self: Box<Self>, request: ScriptRequest) -> BoxFuture<'static, anyhow::Result<Response>>;
}

/// A unit that computes DNS response values. Each returned value is either a scalar, an object of
/// record fields, or an array of those.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    async fn get_record(
        &self,
        name: &str,
        class: DNSClass,
        rtype: RecordType,
        args: &Arguments,
    ) -> anyhow::Result<Value>;
}

/// The entry points a plugin unit may provide. Every probe defaults to "not provided".
pub trait Plugin: Send + Sync {
    fn app(&self) -> Option<&dyn App> {
        None
    }

    fn resource(&self) -> Option<&dyn ResourceFactory> {
        None
    }

    fn record(&self) -> Option<&dyn RecordSource> {
        None
    }

    fn dns_middleware(&self, _function: &str) -> Option<DnsMiddleware> {
        None
    }

    fn http_middleware(&self, _function: &str) -> Option<HttpMiddleware> {
        None
    }

    fn ssl_middleware(&self, _function: &str) -> Option<SslMiddleware> {
        None
    }
}

/// The request handling entry point of a unit, resolved once when the unit is loaded.
pub enum Handler<'a> {
    App(&'a dyn App),
    Resource(&'a dyn ResourceFactory),
    Record(&'a dyn RecordSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    App,
    Resource,
    Record,
}

impl HandlerKind {
    pub(crate) fn probe(plugin: &dyn Plugin) -> Option<Self> {
        if plugin.app().is_some() {
            Some(HandlerKind::App)
        } else if plugin.resource().is_some() {
            Some(HandlerKind::Resource)
        } else if plugin.record().is_some() {
            Some(HandlerKind::Record)
        } else {
            None
        }
    }
}
