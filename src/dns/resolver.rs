use crate::context::Context;
use crate::dns::records::{self, type_code_of, RecordKind};
use crate::dns::{DnsNext, DnsQuery, Lookup, Sections};
use crate::error::Error;
use crate::middleware;
use crate::plugin::{Arguments, Handler};
use crate::store::{Descriptor, Match, Protocol};
use crate::template::Variables;
use anyhow::anyhow;
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};
use trust_dns_proto::rr::{DNSClass, RData, Record};

const DEFAULT_TTL: u32 = 60;

/// Where an action's records are placed.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Authority,
    Additional,
    /// Also used for unrecognised names.
    #[default]
    #[serde(other)]
    Answer,
}

/// One entry of a `dns` descriptor's `action`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DnsAction {
    pub class: Option<Value>,
    #[serde(rename = "type")]
    pub rtype: Option<Value>,
    pub record: Option<String>,
    pub response: Option<Value>,
    pub script: Option<String>,
    #[serde(flatten)]
    pub arguments: Arguments,
    pub random: bool,
    pub ttl: Option<Value>,
    pub section: Section,
    pub authoritative: bool,
}

impl Default for DnsAction {
    fn default() -> Self {
        DnsAction {
            class: None,
            rtype: None,
            record: None,
            response: None,
            script: None,
            arguments: Arguments::default(),
            random: false,
            ttl: None,
            section: Section::Answer,
            authoritative: true,
        }
    }
}

impl DnsAction {
    /// Whether this action answers `query`'s class and type.
    fn qualifies(&self, query: &DnsQuery) -> bool {
        let class = match &self.class {
            None => DNSClass::IN,
            Some(Value::String(name)) => match DNSClass::from_str(&name.to_ascii_uppercase()) {
                Ok(class) => class,
                Err(_) => return false,
            },
            Some(Value::Number(n)) => match n.as_u64().and_then(|n| u16::try_from(n).ok()) {
                Some(code) => match DNSClass::from_u16(code) {
                    Ok(class) => class,
                    Err(_) => return false,
                },
                None => return false,
            },
            Some(_) => return false,
        };
        let rtype = match &self.rtype {
            None => Some(u16::from(query.rtype)),
            Some(value) => type_code_of(value),
        };
        class == query.class && rtype == Some(u16::from(query.rtype))
    }

    fn kind(&self, query: &DnsQuery) -> RecordKind {
        match (&self.record, &self.rtype) {
            (Some(record), _) => RecordKind::from_name(record),
            (None, Some(rtype)) => RecordKind::from_code(type_code_of(rtype).unwrap_or(0)),
            (None, None) => RecordKind::from_code(u16::from(query.rtype)),
        }
    }

    fn ttl(&self) -> Result<u32, Error> {
        let Some(ttl) = &self.ttl else {
            return Ok(DEFAULT_TTL);
        };
        let parsed = match ttl {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| Error::record("TTL", format!("uncastable value {ttl}")))
    }
}

/// Answers DNS queries from the descriptor store.
#[derive(Clone, Debug)]
pub struct Resolver {
    context: Context,
}

impl Resolver {
    pub fn new(context: Context) -> Self {
        Resolver { context }
    }

    /// The descriptor that will answer `query` and the middleware that will wrap it.
    pub fn select(&self, query: &DnsQuery) -> (Option<Match>, Vec<Match>) {
        let store = &self.context.store;
        let candidates = query.candidates();
        let matched = store
            .find(&candidates, |d| d.is(Protocol::Dns))
            .find(|m| answers(&m.descriptor, query));
        let middlewares = store
            .find(&candidates, |d| d.is(Protocol::DnsMiddleware))
            .collect();
        (matched, middlewares)
    }

    /// Run `query` through the matching middleware and the descriptor lookup.
    pub async fn resolve(&self, query: DnsQuery) -> Sections {
        let (matched, middlewares) = self.select(&query);
        match &matched {
            Some(m) => debug!(
                name = %query.name,
                rtype = %query.rtype,
                file = %m.descriptor.file.display(),
                "matched"
            ),
            None => debug!(name = %query.name, rtype = %query.rtype, "no matching descriptor"),
        }

        let context = self.context.clone();
        let terminal: DnsNext = Arc::new(move |lookup: Lookup| -> BoxFuture<'static, Sections> {
            let context = context.clone();
            Box::pin(async move { lookup_records(&context, lookup).await })
        });
        let chain = middleware::compose_blocking(
            middlewares,
            self.context.plugins.clone(),
            |plugin, function| plugin.dns_middleware(function),
            terminal,
        )
        .await;
        chain(Lookup { query, matched }).await
    }
}

fn answers(descriptor: &Descriptor, query: &DnsQuery) -> bool {
    match descriptor.first_action::<DnsAction>() {
        Ok(Some(action)) => action.qualifies(query),
        Ok(None) => false,
        Err(err) => {
            error!(file = %descriptor.file.display(), "invalid dns action: {err}");
            false
        }
    }
}

/// Build the records for the descriptor selected in `lookup`. Each action is evaluated on its own:
/// one that fails is logged and contributes nothing.
async fn lookup_records(context: &Context, lookup: Lookup) -> Sections {
    let mut sections = Sections::default();
    let Some(matched) = lookup.matched else {
        return sections;
    };
    let descriptor = &matched.descriptor;
    let actions: Vec<DnsAction> = match descriptor.actions() {
        Ok(actions) => actions,
        Err(err) => {
            error!(file = %descriptor.file.display(), "invalid dns action: {err}");
            return sections;
        }
    };

    let variables = match (matched.captures(), &descriptor.route) {
        (Some(captures), Some(route)) => context.variables().with_captures(&captures, route),
        _ => Variables::clone(context.variables()),
    };

    let query = &lookup.query;
    for action in actions {
        let records = match build_records(context, query, &action, &variables).await {
            Ok(records) => records,
            Err(err) => {
                error!(
                    name = %query.name,
                    file = %descriptor.file.display(),
                    "skipping dns action: {err}"
                );
                continue;
            }
        };
        if records.is_empty() {
            continue;
        }
        sections.authoritative |= action.authoritative;
        let section = match action.section {
            Section::Answer => &mut sections.answer,
            Section::Authority => &mut sections.authority,
            Section::Additional => &mut sections.additional,
        };
        section.extend(records);
    }
    sections
}

async fn build_records(
    context: &Context,
    query: &DnsQuery,
    action: &DnsAction,
    variables: &Variables,
) -> Result<Vec<Record>, Error> {
    let ttl = action.ttl()?;
    let kind = action.kind(query);

    let fallback = action.response.clone().unwrap_or(Value::Null);
    let mut responses = match &action.script {
        Some(script) => match run_script(context, script, query, &action.arguments).await {
            Ok(responses) => responses,
            Err(err) => {
                error!(script = %script, "error executing script: {err:#}");
                fallback
            }
        },
        None => fallback,
    };
    if action.random {
        responses = pick(responses);
    }

    Ok(records::normalise(kind, responses, variables)?
        .into_iter()
        .map(|(rdata, record_ttl)| record(query, rdata, record_ttl.unwrap_or(ttl)))
        .collect())
}

async fn run_script(
    context: &Context,
    script: &str,
    query: &DnsQuery,
    args: &Arguments,
) -> anyhow::Result<Value> {
    let unit = context.plugins.clone().load_async(script.to_string()).await?;
    let Some(Handler::Record(source)) = unit.handler() else {
        return Err(Error::MissingEntryPoint {
            path: unit.path().to_path_buf(),
            entry: "get_record",
        }
        .into());
    };
    let timeout = context.config.script_timeout;
    tokio::time::timeout(
        timeout,
        source.get_record(&query.name, query.class, query.rtype, args),
    )
    .await
    .map_err(|_| anyhow!("timed out after {timeout:?}"))?
}

fn pick(responses: Value) -> Value {
    match responses {
        Value::Array(items) => items
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or(Value::Null),
        single => single,
    }
}

fn record(query: &DnsQuery, rdata: RData, ttl: u32) -> Record {
    let mut record = Record::from_rdata(query.wire_name.clone(), ttl, rdata);
    record.set_dns_class(query.class);
    record
}
