//! Descriptor driven DNS server.
//!
//! Queries are answered from descriptors with `"protocol": "dns"`. The query name (lowercased,
//! IDNA decoded, without the trailing dot) is searched with each descriptor's `route`; the first
//! descriptor whose action `class` (default `IN`) and `type` (default: the query type) agree with
//! the query provides the answer.
//!
//! ```json
//! [
//!   {
//!     "protocol": "dns",
//!     "route": "^(\\d+)\\.(\\d+)\\.(\\d+)\\.(\\d+)\\.ip\\.example\\.com$",
//!     "action": { "type": "A", "response": "$1.$2.$3.$4", "ttl": 5 }
//!   },
//!   {
//!     "protocol": "dns",
//!     "route": "example\\.com$",
//!     "action": [
//!       { "type": "TXT", "response": ["v=spf1 -all"] },
//!       { "type": "TXT", "record": "NS", "response": "ns1.example.com", "section": "authority" }
//!     ]
//!   }
//! ]
//! ```
//!
//! An action's values come from `response` or from the `get_record` entry point of the plugin
//! unit named by `script`. `random` picks a single value. Values are turned into records as
//! described in [`records`]; `ttl` defaults to 60 seconds, `section` to the answer section and
//! `authoritative` to true.
//!
//! Descriptors with `"protocol": "dns_middleware"` matching the query name wrap the lookup, see
//! [`crate::middleware`].
//!
//! A query that produces no records is answered with an authoritative `NXDOMAIN`. Anything other
//! than a standard query gets `NOTIMP`.

mod handlers;
pub mod records;
mod resolver;
pub mod server;

pub use resolver::{DnsAction, Resolver, Section};
pub use server::new;

use crate::error::Error;
use crate::middleware::{MiddlewareFn, Next};
use crate::store::Match;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use trust_dns_proto::rr::{DNSClass, Name, Record, RecordType};

/// A question, with the name normalised for matching.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    /// Lowercased, IDNA decoded, without the trailing dot.
    pub name: String,
    /// The name as received, used as the owner of answer records.
    pub wire_name: Name,
    pub class: DNSClass,
    pub rtype: RecordType,
    pub src: Option<SocketAddr>,
}

impl DnsQuery {
    pub fn new(wire_name: Name, class: DNSClass, rtype: RecordType, src: Option<SocketAddr>) -> Self {
        let name = wire_name.to_utf8();
        DnsQuery {
            name: name.trim_end_matches('.').to_lowercase(),
            wire_name,
            class,
            rtype,
            src,
        }
    }

    /// Build an `IN` question from `dns://name[?type=AAAA]`, or a bare name. The type defaults to
    /// `A` and may be given by name or number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for an unknown type and [`Error::DNSError`] for an invalid
    /// name.
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        let rest = uri.strip_prefix("dns://").unwrap_or(uri);
        let (name, params) = rest.split_once('?').unwrap_or((rest, ""));
        let mut rtype = RecordType::A;
        for (key, value) in params.split('&').filter_map(|p| p.split_once('=')) {
            if key == "type" {
                let code = records::type_code(value)
                    .ok_or_else(|| Error::InvalidUrl(format!("unknown record type {value:?} in {uri}")))?;
                rtype = RecordType::from(code);
            }
        }
        let name = Name::from_utf8(name.trim_end_matches('/'))?;
        Ok(Self::new(name, DNSClass::IN, rtype, None))
    }

    /// The candidate strings descriptors are matched against.
    pub fn candidates(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

/// The unit of work passed through DNS middleware: the query and the descriptor selected for it.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub query: DnsQuery,
    pub matched: Option<Match>,
}

/// The records produced for a query.
#[derive(Debug, Clone, Default)]
pub struct Sections {
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
    /// Set when any contributing action was authoritative.
    pub authoritative: bool,
}

impl Sections {
    pub fn is_empty(&self) -> bool {
        self.answer.is_empty() && self.authority.is_empty() && self.additional.is_empty()
    }

    pub fn len(&self) -> usize {
        self.answer.len() + self.authority.len() + self.additional.len()
    }
}

pub type DnsNext = Next<Lookup, BoxFuture<'static, Sections>>;
pub type DnsMiddleware = MiddlewareFn<Lookup, BoxFuture<'static, Sections>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_names_are_normalised() {
        let q = DnsQuery::new(
            Name::from_ascii("WWW.Example.COM.").unwrap(),
            DNSClass::IN,
            RecordType::A,
            None,
        );
        assert_eq!(q.name, "www.example.com");
        assert_eq!(q.candidates(), vec!["www.example.com".to_string()]);

        let q = DnsQuery::new(
            Name::from_ascii("xn--bcher-kva.example.").unwrap(),
            DNSClass::IN,
            RecordType::A,
            None,
        );
        assert_eq!(q.name, "bücher.example");
    }

    #[test]
    fn queries_from_uris() {
        let q = DnsQuery::from_uri("dns://Host.Example.com?type=AAAA").unwrap();
        assert_eq!(q.name, "host.example.com");
        assert_eq!(q.rtype, RecordType::AAAA);
        assert_eq!(q.class, DNSClass::IN);

        let q = DnsQuery::from_uri("example.com").unwrap();
        assert_eq!(q.rtype, RecordType::A);
        assert_eq!(DnsQuery::from_uri("dns://example.com/?type=257").unwrap().rtype, RecordType::CAA);
        assert!(matches!(
            DnsQuery::from_uri("dns://example.com?type=BOGUS"),
            Err(Error::InvalidUrl(_))
        ));
    }
}
