//! ruleserv
//!
//! A rule driven multi-protocol server. JSON *descriptor* documents below a files root say how to
//! answer DNS queries, HTTP(S) requests and TLS handshakes; the server keeps them loaded and picks
//! up edits without restarting.
//!
//! ```json
//! [
//!   { "protocol": "dns", "route": "^rebind\\.example\\.com$", "action": { "type": "A", "response": "{{ipv4_address}}" } },
//!   { "protocol": "http", "route": "^/raw$", "action": { "handler": "raw", "code": 202, "body": "OK" } }
//! ]
//! ```
//!
//! Behaviour that isn't data (computed records, script responses, middleware) lives in plugin
//! units, see [`plugin`]. The [`Context`] created at startup ties the [`Config`], the
//! descriptor [store](store::RouteStore) and the [plugin loader](plugin::PluginLoader) together
//! and is handed to each front end: [`dns::new`], [`http::new`].
//!
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod dns;
pub mod error;
pub mod http;
pub mod middleware;
pub mod plugin;
pub mod sandbox;
pub mod store;
pub mod template;
pub mod tls;

pub use config::{Config, Service, SharedConfig};
pub use context::Context;
pub use dns::new as new_dns;
pub use http::new as new_http;
pub use store::{Descriptor, Match, RouteStore};
