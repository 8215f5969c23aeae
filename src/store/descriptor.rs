use crate::error::Error;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The protocols a [`Descriptor`] can be selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Dns,
    Http,
    DnsMiddleware,
    HttpMiddleware,
    SslMiddleware,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Dns => "dns",
            Protocol::Http => "http",
            Protocol::DnsMiddleware => "dns_middleware",
            Protocol::HttpMiddleware => "http_middleware",
            Protocol::SslMiddleware => "ssl_middleware",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule loaded from a descriptor document.
///
/// The `document` holds the whole object after variable expansion, so keys the server does not
/// interpret (`id`, `name`, comments) remain available for diagnostics. Provenance (`file`,
/// `index`, `id`) is never used for matching.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub protocol: Option<String>,
    pub route: Option<Regex>,
    pub action: Option<Value>,
    pub sort_index: i64,
    pub document: Map<String, Value>,
    pub file: PathBuf,
    pub index: usize,
    pub id: String,
}

impl Descriptor {
    /// Build a descriptor from an already templated document element.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDocument`] if `value` is not an object or `sort_index` is not an
    /// integer, and [`Error::InvalidRegex`] if `route` doesn't compile.
    pub fn from_value(
        value: Value,
        file: &Path,
        index: usize,
        default_sort_index: i64,
    ) -> Result<Self, Error> {
        let Value::Object(document) = value else {
            return Err(Error::InvalidDocument(file.to_path_buf()));
        };
        let sort_index = match document.get("sort_index") {
            None => default_sort_index,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| Error::InvalidDocument(file.to_path_buf()))?,
        };
        let route = match document.get("route") {
            None => None,
            Some(Value::String(pattern)) => Some(Regex::new(pattern)?),
            Some(_) => return Err(Error::InvalidDocument(file.to_path_buf())),
        };
        Ok(Descriptor {
            protocol: document
                .get("protocol")
                .and_then(Value::as_str)
                .map(str::to_string),
            route,
            action: document.get("action").cloned(),
            sort_index,
            file: file.to_path_buf(),
            index,
            id: format!("{:016x}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            document,
        })
    }

    pub fn is(&self, protocol: Protocol) -> bool {
        self.protocol.as_deref() == Some(protocol.as_str())
    }

    /// Whether `candidate` satisfies `route`. This is a search, not an anchored match, and a
    /// descriptor without a `route` matches everything.
    pub fn matches(&self, candidate: &str) -> bool {
        self.route.as_ref().map_or(true, |r| r.is_match(candidate))
    }

    pub fn captures<'c>(&self, candidate: &'c str) -> Option<Captures<'c>> {
        self.route.as_ref().and_then(|r| r.captures(candidate))
    }

    /// The action entries of this descriptor. `action` may be a single object or an array of
    /// objects, evaluated in document order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if an entry doesn't have the shape `T` expects.
    pub fn actions<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        action_entries(self.action.clone())
    }

    /// The first action entry, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if the entry doesn't have the shape `T` expects.
    pub fn first_action<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        Ok(self.actions::<T>()?.into_iter().next())
    }

    /// The document with its provenance, as shown by the `route` command.
    pub fn to_json(&self) -> Value {
        let mut document = self.document.clone();
        document.insert("sort_index".into(), self.sort_index.into());
        document.insert("_route_file".into(), self.file.display().to_string().into());
        document.insert("_route_index".into(), self.index.into());
        document.insert("_id".into(), self.id.clone().into());
        Value::Object(document)
    }
}

/// Split an object-or-array action value into typed entries.
fn action_entries<T: DeserializeOwned>(action: Option<Value>) -> Result<Vec<T>, Error> {
    match action {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .map(|e| serde_json::from_value(e).map_err(Error::from))
            .collect(),
        Some(entry) => Ok(vec![serde_json::from_value(entry)?]),
    }
}

/// A descriptor together with the candidate string its `route` matched.
#[derive(Debug, Clone)]
pub struct Match {
    pub descriptor: Arc<Descriptor>,
    pub candidate: String,
}

impl Match {
    pub fn captures(&self) -> Option<Captures<'_>> {
        self.descriptor.captures(&self.candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Raw {
        code: u16,
    }

    #[test]
    fn defaults_and_explicit_sort_index() {
        let file = Path::new("/routes/10-a.json");
        let d = Descriptor::from_value(json!({"protocol": "http"}), file, 0, 10).unwrap();
        assert_eq!(d.sort_index, 10);
        assert!(d.is(Protocol::Http));
        assert!(!d.is(Protocol::Dns));

        let d = Descriptor::from_value(json!({"sort_index": 3}), file, 1, 10).unwrap();
        assert_eq!(d.sort_index, 3);
        assert_eq!(d.index, 1);
    }

    #[test]
    fn route_is_a_search() {
        let file = Path::new("x.json");
        let d = Descriptor::from_value(json!({"route": "example"}), file, 0, 0).unwrap();
        assert!(d.matches("www.example.com"));
        assert!(!d.matches("www.test.com"));

        let d = Descriptor::from_value(json!({}), file, 0, 0).unwrap();
        assert!(d.matches("anything"));
    }

    #[test]
    fn rejects_bad_elements() {
        let file = Path::new("x.json");
        assert!(matches!(
            Descriptor::from_value(json!("nope"), file, 0, 0),
            Err(Error::InvalidDocument(_))
        ));
        assert!(matches!(
            Descriptor::from_value(json!({"route": "("}), file, 0, 0),
            Err(Error::InvalidRegex(_))
        ));
    }

    #[test]
    fn action_object_or_array() {
        let file = Path::new("x.json");
        let d = Descriptor::from_value(json!({"action": {"code": 201}}), file, 0, 0).unwrap();
        assert_eq!(d.actions::<Raw>().unwrap(), vec![Raw { code: 201 }]);

        let d = Descriptor::from_value(
            json!({"action": [{"code": 201}, {"code": 202}]}),
            file,
            0,
            0,
        )
        .unwrap();
        assert_eq!(d.actions::<Raw>().unwrap().len(), 2);

        let d = Descriptor::from_value(json!({}), file, 0, 0).unwrap();
        assert!(d.first_action::<Raw>().unwrap().is_none());
    }

    #[test]
    fn ids_are_unique() {
        let file = Path::new("x.json");
        let a = Descriptor::from_value(json!({}), file, 0, 0).unwrap();
        let b = Descriptor::from_value(json!({}), file, 0, 0).unwrap();
        assert_ne!(a.id, b.id);
    }
}
