//! Record construction from descriptor response values.
//!
//! A response value is either a scalar, which is placed under the record type's default field, or
//! an object of named fields. Every field is coerced to the wire type the record needs; `ttl` is
//! accepted by every record type and overrides the action's `ttl`.

use crate::error::Error;
use crate::template::Variables;
use serde_json::{Map, Value};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use trust_dns_proto::rr::rdata::{MX, NULL, SOA, SRV, TXT};
use trust_dns_proto::rr::{Name, RData, RecordType};

const SPF_CODE: u16 = 99;
const CAA_CODE: u16 = 257;

/// The wire type a response field is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Strings,
    Int,
}

/// The record types responses can be built for. Everything not listed is an opaque record carrying
/// its `data` verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Ns,
    Ptr,
    Mx,
    Txt,
    Spf,
    Soa,
    Srv,
    Caa,
    Opaque(u16),
}

const KNOWN: [RecordKind; 11] = [
    RecordKind::A,
    RecordKind::Aaaa,
    RecordKind::Cname,
    RecordKind::Ns,
    RecordKind::Ptr,
    RecordKind::Mx,
    RecordKind::Txt,
    RecordKind::Spf,
    RecordKind::Soa,
    RecordKind::Srv,
    RecordKind::Caa,
];

impl RecordKind {
    /// Look a record type up by its symbolic name, or by a numeric code given as text.
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        KNOWN
            .into_iter()
            .find(|kind| kind.name() == upper)
            .unwrap_or_else(|| RecordKind::from_code(type_code(&upper).unwrap_or(0)))
    }

    pub fn from_code(code: u16) -> Self {
        KNOWN
            .into_iter()
            .find(|kind| kind.code() == code)
            .unwrap_or(RecordKind::Opaque(code))
    }

    pub fn code(self) -> u16 {
        match self {
            RecordKind::A => u16::from(RecordType::A),
            RecordKind::Aaaa => u16::from(RecordType::AAAA),
            RecordKind::Cname => u16::from(RecordType::CNAME),
            RecordKind::Ns => u16::from(RecordType::NS),
            RecordKind::Ptr => u16::from(RecordType::PTR),
            RecordKind::Mx => u16::from(RecordType::MX),
            RecordKind::Txt => u16::from(RecordType::TXT),
            RecordKind::Spf => SPF_CODE,
            RecordKind::Soa => u16::from(RecordType::SOA),
            RecordKind::Srv => u16::from(RecordType::SRV),
            RecordKind::Caa => CAA_CODE,
            RecordKind::Opaque(code) => code,
        }
    }

    pub fn name(self) -> String {
        match self {
            RecordKind::A => "A".into(),
            RecordKind::Aaaa => "AAAA".into(),
            RecordKind::Cname => "CNAME".into(),
            RecordKind::Ns => "NS".into(),
            RecordKind::Ptr => "PTR".into(),
            RecordKind::Mx => "MX".into(),
            RecordKind::Txt => "TXT".into(),
            RecordKind::Spf => "SPF".into(),
            RecordKind::Soa => "SOA".into(),
            RecordKind::Srv => "SRV".into(),
            RecordKind::Caa => "CAA".into(),
            RecordKind::Opaque(code) => format!("TYPE{code}"),
        }
    }

    /// The field a scalar response is stored under, if the type has one.
    pub fn default_field(self) -> Option<&'static str> {
        match self {
            RecordKind::A | RecordKind::Aaaa => Some("address"),
            RecordKind::Cname | RecordKind::Ns | RecordKind::Ptr | RecordKind::Mx => Some("name"),
            RecordKind::Txt | RecordKind::Spf | RecordKind::Caa | RecordKind::Opaque(_) => {
                Some("data")
            }
            RecordKind::Soa | RecordKind::Srv => None,
        }
    }

    pub fn field_kind(self, field: &str) -> Option<FieldKind> {
        use FieldKind::{Int, Strings, Text};
        let fields: &[(&str, FieldKind)] = match self {
            RecordKind::A | RecordKind::Aaaa => &[("address", Text)],
            RecordKind::Cname | RecordKind::Ns | RecordKind::Ptr => &[("name", Text)],
            RecordKind::Mx => &[("preference", Int), ("name", Text)],
            RecordKind::Txt | RecordKind::Spf => &[("data", Strings)],
            RecordKind::Soa => &[
                ("mname", Text),
                ("rname", Text),
                ("serial", Int),
                ("refresh", Int),
                ("retry", Int),
                ("expire", Int),
                ("minimum", Int),
            ],
            RecordKind::Srv => &[
                ("priority", Int),
                ("weight", Int),
                ("port", Int),
                ("target", Text),
            ],
            RecordKind::Caa | RecordKind::Opaque(_) => &[("data", Text)],
        };
        if field == "ttl" {
            return Some(Int);
        }
        fields.iter().find(|(name, _)| *name == field).map(|(_, kind)| *kind)
    }

    fn build(self, fields: &Fields) -> Result<RData, Error> {
        let rdata = match self {
            RecordKind::A => RData::A(
                fields
                    .parse::<Ipv4Addr>("address")?
                    .unwrap_or(Ipv4Addr::UNSPECIFIED),
            ),
            RecordKind::Aaaa => RData::AAAA(
                fields
                    .parse::<Ipv6Addr>("address")?
                    .unwrap_or(Ipv6Addr::UNSPECIFIED),
            ),
            RecordKind::Cname => RData::CNAME(fields.name("name")?),
            RecordKind::Ns => RData::NS(fields.name("name")?),
            RecordKind::Ptr => RData::PTR(fields.name("name")?),
            RecordKind::Mx => RData::MX(MX::new(fields.int("preference")?, fields.name("name")?)),
            RecordKind::Txt => RData::TXT(TXT::from_bytes(chunked(&fields.strings("data")?))),
            RecordKind::Spf => opaque(SPF_CODE, character_strings(&fields.strings("data")?)),
            RecordKind::Soa => RData::SOA(SOA::new(
                fields.name("mname")?,
                fields.name("rname")?,
                fields.int("serial")?,
                fields.int("refresh")?,
                fields.int("retry")?,
                fields.int("expire")?,
                fields.int("minimum")?,
            )),
            RecordKind::Srv => RData::SRV(SRV::new(
                fields.int("priority")?,
                fields.int("weight")?,
                fields.int("port")?,
                fields.name("target")?,
            )),
            RecordKind::Caa => {
                let data = fields.text("data")?.unwrap_or_default();
                opaque(CAA_CODE, caa(&data).map_err(|reason| fields.error(reason))?)
            }
            RecordKind::Opaque(code) => {
                opaque(code, fields.text("data")?.unwrap_or_default().into_bytes())
            }
        };
        Ok(rdata)
    }
}

/// Resolve a symbolic or numeric record type to its code. `TYPEnnn` (RFC 3597) is accepted for
/// any type. Returns `None` for unknown names.
pub fn type_code(name: &str) -> Option<u16> {
    let name = name.trim();
    if let Ok(code) = name.parse::<u16>() {
        return Some(code);
    }
    let upper = name.to_ascii_uppercase();
    if let Some(code) = upper.strip_prefix("TYPE").and_then(|n| n.parse::<u16>().ok()) {
        return Some(code);
    }
    if let Some(kind) = KNOWN.into_iter().find(|kind| kind.name() == upper) {
        return Some(kind.code());
    }
    match RecordType::from_str(&upper) {
        Ok(RecordType::Unknown(_)) | Err(_) => None,
        Ok(rtype) => Some(u16::from(rtype)),
    }
}

/// Resolve an action's `type` value, a name or a number, to a record type code.
pub fn type_code_of(value: &Value) -> Option<u16> {
    match value {
        Value::String(name) => type_code(name),
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        _ => None,
    }
}

/// Build records of `kind` from `responses`, expanding placeholders in every field with
/// `variables` first. Each result carries the record's own `ttl`, if it specified one.
///
/// # Errors
///
/// Returns [`Error::Record`] if a scalar is given for a type without a default field, a field is
/// unknown to the type, or a field value can't be coerced to the type's wire form.
pub fn normalise(
    kind: RecordKind,
    responses: Value,
    variables: &Variables,
) -> Result<Vec<(RData, Option<u32>)>, Error> {
    let responses = match responses {
        Value::Null => vec![],
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut records = Vec::with_capacity(responses.len());
    for response in responses {
        let map = match response {
            Value::Object(map) => map,
            scalar => {
                let Some(field) = kind.default_field() else {
                    return Err(Error::record(kind.name(), "record has no default field"));
                };
                let mut map = Map::new();
                map.insert(field.to_string(), scalar);
                map
            }
        };
        let map: Map<String, Value> = map
            .into_iter()
            .map(|(k, v)| (k, variables.substitute_value(v)))
            .collect();
        for field in map.keys() {
            if kind.field_kind(field).is_none() {
                return Err(Error::record(kind.name(), format!("unknown argument \"{field}\"")));
            }
        }

        let fields = Fields { kind, map };
        let ttl = fields.optional_int::<u32>("ttl")?;
        records.push((kind.build(&fields)?, ttl));
    }
    Ok(records)
}

struct Fields {
    kind: RecordKind,
    map: Map<String, Value>,
}

impl Fields {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::record(self.kind.name(), reason)
    }

    fn uncastable(&self, value: &Value) -> Error {
        self.error(format!("uncastable value {value}"))
    }

    fn text(&self, field: &str) -> Result<Option<String>, Error> {
        match self.map.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(self.uncastable(other)),
        }
    }

    fn strings(&self, field: &str) -> Result<Vec<String>, Error> {
        let item = |value: &Value| match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(self.uncastable(other)),
        };
        match self.map.get(field) {
            None => Ok(vec![]),
            Some(Value::Array(items)) => items.iter().map(item).collect(),
            Some(value) => Ok(vec![item(value)?]),
        }
    }

    fn optional_int<T: TryFrom<i64>>(&self, field: &str) -> Result<Option<T>, Error> {
        let Some(value) = self.map.get(field) else {
            return Ok(None);
        };
        let n = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        n.and_then(|n| T::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| self.uncastable(value))
    }

    fn int<T: TryFrom<i64> + Default>(&self, field: &str) -> Result<T, Error> {
        Ok(self.optional_int(field)?.unwrap_or_default())
    }

    fn parse<T: FromStr>(&self, field: &str) -> Result<Option<T>, Error> {
        match self.text(field)? {
            None => Ok(None),
            Some(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.error(format!("invalid {field} \"{s}\""))),
        }
    }

    fn name(&self, field: &str) -> Result<Name, Error> {
        match self.text(field)? {
            None => Ok(Name::root()),
            Some(s) if s.is_empty() => Ok(Name::root()),
            Some(s) => Name::from_utf8(&s)
                .map_err(|err| self.error(format!("invalid {field} \"{s}\": {err}"))),
        }
    }
}

fn opaque(code: u16, data: Vec<u8>) -> RData {
    let rdata = if data.is_empty() {
        NULL::new()
    } else {
        NULL::with(data)
    };
    RData::Unknown { code, rdata }
}

/// Split strings into pieces that fit a DNS character-string (255 bytes).
fn chunked(strings: &[String]) -> Vec<&[u8]> {
    let mut pieces = Vec::with_capacity(strings.len());
    for s in strings {
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            pieces.push(bytes);
        }
        pieces.extend(bytes.chunks(255));
    }
    pieces
}

/// Encode strings as consecutive length-prefixed character-strings.
fn character_strings(strings: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in chunked(strings) {
        #[allow(clippy::cast_possible_truncation)]
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Encode textual `flags tag value` CAA data. Double quotes are dropped from the value.
fn caa(data: &str) -> Result<Vec<u8>, String> {
    let mut parts = data.splitn(3, ' ');
    let (Some(flags), Some(tag), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected \"flags tag value\", got \"{data}\""));
    };
    let flags: u8 = flags
        .parse()
        .map_err(|_| format!("invalid flags \"{flags}\""))?;
    let tag_len = u8::try_from(tag.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or_else(|| format!("invalid tag \"{tag}\""))?;

    let mut out = vec![flags, tag_len];
    out.extend_from_slice(tag.as_bytes());
    out.extend(value.bytes().filter(|b| *b != b'"'));
    Ok(out)
}
