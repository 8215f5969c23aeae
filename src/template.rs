//! Variable templating.
//!
//! Descriptor fields may reference entries of the process-wide variable table as `{{name}}`.
//! Request-time expansion additionally understands `$N`, the N-th capture group of the matching
//! `route`. At load time, placeholders with no bound value are left untouched since they may be
//! bound per request. At request time they expand to the empty string.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::sync::Arc;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}").expect("placeholder pattern");
    static ref PLACEHOLDER_OR_GROUP: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\s*\}\}|\$([0-9]+)").expect("placeholder pattern");
}

/// `SharedVariables` is the immutable variable table shared by every component for the lifetime
/// of the process.
pub type SharedVariables = Arc<Variables>;

#[derive(Clone, Copy)]
enum Unbound {
    Keep,
    Blank,
}

/// A flat name to value table consumed by templating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(HashMap<String, String>);

impl Variables {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    /// Build the default table: the detected outbound IPv4/IPv6 addresses, overlaid by `values`.
    /// Non-string values are rendered as JSON text.
    pub fn detect(values: &serde_json::Map<String, Value>) -> Self {
        let mut table = HashMap::new();
        table.insert("ipv4_address".to_string(), ipv4_address().to_string());
        table.insert("ipv6_address".to_string(), ipv6_address().to_string());
        for (k, v) in values {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            table.insert(k.clone(), v);
        }
        Self(table)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a copy of this table with `extra` layered on top.
    #[must_use]
    pub fn with<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut table = self.0.clone();
        table.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self(table)
    }

    /// Return a copy of this table with the groups of `captures` bound as `1`, `2`, ... and by
    /// name. Groups that did not participate in the match are bound to the empty string.
    #[must_use]
    pub fn with_captures(&self, captures: &Captures, names: &Regex) -> Self {
        let numbered = (1..captures.len()).map(|i| {
            let value = captures.get(i).map_or("", |m| m.as_str());
            (i.to_string(), value.to_string())
        });
        let named = names.capture_names().flatten().map(|name| {
            let value = captures.name(name).map_or("", |m| m.as_str());
            (name.to_string(), value.to_string())
        });
        self.with(numbered.chain(named))
    }

    /// Expand `{{name}}` placeholders in `s`.
    pub fn expand(&self, s: &str) -> String {
        self.replace(&PLACEHOLDER, s, false, Unbound::Keep)
    }

    /// Expand `{{name}}` placeholders in `s`, regex-escaping substituted values.
    pub fn expand_escaped(&self, s: &str) -> String {
        self.replace(&PLACEHOLDER, s, true, Unbound::Keep)
    }

    /// Expand `{{name}}` placeholders and `$N` capture group references in `s`. Unbound
    /// references become empty.
    pub fn substitute(&self, s: &str) -> String {
        self.replace(&PLACEHOLDER_OR_GROUP, s, false, Unbound::Blank)
    }

    /// Recursively expand `{{name}}` placeholders in every string of `value`. The direct string
    /// value of a `route` key is expanded with regex-escaping.
    pub fn expand_value(&self, value: Value) -> Value {
        self.map_strings(value, &|s, route| {
            if route {
                self.expand_escaped(s)
            } else {
                self.expand(s)
            }
        })
    }

    /// Recursively apply [`Variables::substitute`] to every string of `value`.
    pub fn substitute_value(&self, value: Value) -> Value {
        self.map_strings(value, &|s, _| self.substitute(s))
    }

    fn map_strings(&self, value: Value, f: &dyn Fn(&str, bool) -> String) -> Value {
        match value {
            Value::String(s) => Value::String(f(&s, false)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.map_strings(v, f)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) if k == "route" => Value::String(f(&s, true)),
                            other => self.map_strings(other, f),
                        };
                        (k, v)
                    })
                    .collect(),
            ),
            other => other,
        }
    }

    fn replace(&self, pattern: &Regex, s: &str, escape: bool, unbound: Unbound) -> String {
        pattern
            .replace_all(s, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map_or("", |m| m.as_str());
                match self.0.get(name) {
                    Some(value) if escape => regex::escape(value),
                    Some(value) => value.clone(),
                    None => match unbound {
                        Unbound::Keep => caps[0].to_string(),
                        Unbound::Blank => String::new(),
                    },
                }
            })
            .into_owned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The local address used to reach `8.8.8.8`, or loopback when there is no IPv4 route.
pub fn ipv4_address() -> IpAddr {
    probe_local_addr("0.0.0.0:0", "8.8.8.8:80").unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// The local address used to reach `2001:4860:4860::8888`, or loopback when there is no IPv6
/// route.
pub fn ipv6_address() -> IpAddr {
    probe_local_addr("[::]:0", "[2001:4860:4860::8888]:80")
        .unwrap_or(IpAddr::V6(Ipv6Addr::LOCALHOST))
}

// Connecting a UDP socket sends nothing, it only selects the outbound interface.
fn probe_local_addr(bind: &str, dest: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(dest).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
