//! Compact naming and gzip for the binary socket transports.
//!
//! TCP and UDP abbreviate field names before sealing and gzip the serialized envelope. UDP goes
//! further (one-letter names, enum ordinals, trimmed ext values) to stay under the packet budget.
//! None of this touches the crypto contract.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};

use super::envelope::{fields, Envelope, FieldMap, SealedRequest, Sidecar};
use crate::error::CodecError;
use crate::model::{AuthType, LogoutType, Reply, UpgradeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldStyle {
    /// Full `x-oauth-*` names.
    #[default]
    Full,
    Tcp,
    Udp,
}

/// Envelope member names per style: ciphertext, access key, signature, timestamp, correlation id,
/// serial, encode flag, sub-protocol, upgrade type.
struct EnvelopeNames {
    ciphertext: &'static str,
    access_key: &'static str,
    signature: &'static str,
    timestamp: &'static str,
    nonce: &'static str,
    serial: &'static str,
    encode: &'static str,
    sub_protocol: &'static str,
    upgrade_type: &'static str,
}

const TCP_ENVELOPE: EnvelopeNames = EnvelopeNames {
    ciphertext: "ct",
    access_key: "ak",
    signature: "sg",
    timestamp: "ts",
    nonce: "id",
    serial: "sr",
    encode: "ec",
    sub_protocol: "sp",
    upgrade_type: "ut",
};

const UDP_ENVELOPE: EnvelopeNames = EnvelopeNames {
    ciphertext: "c",
    access_key: "a",
    signature: "s",
    timestamp: "t",
    nonce: "i",
    serial: "r",
    encode: "e",
    sub_protocol: "p",
    upgrade_type: "u",
};

const FULL_ENVELOPE: EnvelopeNames = EnvelopeNames {
    ciphertext: "ciphertext",
    access_key: "accessKey",
    signature: "signature",
    timestamp: "timestamp",
    nonce: "nonce",
    serial: "ephemeralKeyId",
    encode: "encode",
    sub_protocol: "subProtocol",
    upgrade_type: "upgradeType",
};

impl FieldStyle {
    fn field_name(self, key: &str) -> Option<&'static str> {
        let (tcp, udp) = match key {
            fields::ACCESS_KEY => ("ak", "a"),
            fields::USERNAME => ("u", "u"),
            fields::PASSWORD => ("p", "p"),
            fields::AUTH_TYPE => ("at", "t"),
            fields::EXT => ("ext", "e"),
            fields::COOKIE => ("c", "c"),
            fields::TOKEN => ("t", "k"),
            fields::UID => ("uid", "i"),
            fields::LOGOUT_TYPE => ("lt", "l"),
            fields::SUB_PROTOCOL => ("sp", "s"),
            fields::REFRESH_TOKEN => ("rt", "r"),
            fields::UPGRADE_TYPE => ("ut", "g"),
            fields::PARAM_ADDRESS => ("pa", "d"),
            fields::PARAM_APP_NAME => ("pn", "n"),
            fields::EXT_TIMESTAMP => ("ts", "m"),
            _ => return None,
        };
        match self {
            FieldStyle::Full => None,
            FieldStyle::Tcp => Some(tcp),
            FieldStyle::Udp => Some(udp),
        }
    }

    fn envelope_names(self) -> &'static EnvelopeNames {
        match self {
            FieldStyle::Full => &FULL_ENVELOPE,
            FieldStyle::Tcp => &TCP_ENVELOPE,
            FieldStyle::Udp => &UDP_ENVELOPE,
        }
    }

    /// Renames known fields and compresses `ext`. Unknown fields keep their names.
    pub fn abbreviate(self, field_map: &FieldMap) -> FieldMap {
        if self == FieldStyle::Full {
            return field_map.clone();
        }
        field_map
            .iter()
            .map(|(key, value)| {
                let value = match key.as_str() {
                    fields::EXT => self.compress_ext(value),
                    fields::AUTH_TYPE if self == FieldStyle::Udp => {
                        ordinal(value, |s| AuthType::from_wire(s).map(AuthType::ordinal))
                    }
                    fields::LOGOUT_TYPE if self == FieldStyle::Udp => {
                        ordinal(value, |s| LogoutType::from_wire(s).map(LogoutType::ordinal))
                    }
                    fields::UPGRADE_TYPE if self == FieldStyle::Udp => {
                        ordinal(value, |s| UpgradeType::from_wire(s).map(UpgradeType::ordinal))
                    }
                    _ => value.clone(),
                };
                let name = self.field_name(key).map(str::to_string).unwrap_or_else(|| key.clone());
                (name, value)
            })
            .collect()
    }

    /// Keeps address, fingerprint, user agent and timezone under short names.
    fn compress_ext(self, ext: &Value) -> Value {
        let Some(ext) = ext.as_object() else { return ext.clone() };
        let mut out = Map::new();
        let udp = self == FieldStyle::Udp;
        if let Some(address) = ext.get("address") {
            out.insert(if udp { "a" } else { "addr" }.into(), address.clone());
        }
        if let Some(fingerprint) = ext.get("fingerprint") {
            let value = match fingerprint.as_str() {
                Some(fp) if udp => Value::String(fp.chars().take(16).collect()),
                _ => fingerprint.clone(),
            };
            out.insert(if udp { "f" } else { "fp" }.into(), value);
        }
        if let Some(ua) = ext.get("ua") {
            let value = match ua.as_str() {
                Some(ua) if udp => Value::String(compress_user_agent(ua)),
                _ => ua.clone(),
            };
            out.insert(if udp { "u" } else { "ua" }.into(), value);
        }
        if let Some(timezone) = ext.get("timezone") {
            out.insert(if udp { "z" } else { "tz" }.into(), timezone.clone());
        }
        Value::Object(out)
    }

    /// The sealed request as a JSON object with this style's member names.
    pub fn envelope_value(self, sealed: &SealedRequest) -> Value {
        let names = self.envelope_names();
        let envelope = &sealed.envelope;
        let mut out = Map::new();
        out.insert(names.ciphertext.into(), Value::String(envelope.ciphertext.clone()));
        out.insert(names.access_key.into(), Value::String(envelope.access_key.clone()));
        out.insert(names.signature.into(), Value::String(envelope.signature.clone()));
        out.insert(names.timestamp.into(), Value::from(envelope.timestamp));
        out.insert(names.nonce.into(), Value::String(envelope.nonce.clone()));
        out.insert(names.serial.into(), Value::String(envelope.ephemeral_key_id.clone()));
        out.insert(names.encode.into(), Value::Bool(sealed.sidecar.encode));
        if let Some(sub_protocol) = &sealed.sidecar.sub_protocol {
            out.insert(names.sub_protocol.into(), Value::String(sub_protocol.clone()));
        }
        if let Some(upgrade_type) = &sealed.sidecar.upgrade_type {
            out.insert(names.upgrade_type.into(), Value::String(upgrade_type.clone()));
        }
        Value::Object(out)
    }

    /// Inverse of [`envelope_value`](Self::envelope_value).
    pub fn read_envelope(self, value: &Value) -> Result<(Envelope, Sidecar), CodecError> {
        let names = self.envelope_names();
        let object = value
            .as_object()
            .ok_or_else(|| CodecError::Malformed("envelope is not an object".into()))?;
        let text = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CodecError::Malformed(format!("missing {}", name)))
        };
        let envelope = Envelope {
            ciphertext: text(names.ciphertext)?,
            ephemeral_key_id: text(names.serial)?,
            access_key: text(names.access_key)?,
            signature: text(names.signature)?,
            timestamp: object.get(names.timestamp).and_then(Value::as_u64).unwrap_or(0),
            nonce: text(names.nonce)?,
        };
        let sidecar = Sidecar {
            encode: object.get(names.encode).and_then(Value::as_bool).unwrap_or(true),
            sub_protocol: text(names.sub_protocol).ok(),
            upgrade_type: text(names.upgrade_type).ok(),
        };
        Ok((envelope, sidecar))
    }
}

fn ordinal(value: &Value, lookup: impl Fn(&str) -> Option<u8>) -> Value {
    value.as_str().and_then(lookup).map(Value::from).unwrap_or_else(|| value.clone())
}

/// Browser family letter plus major version, for user agents of 20 chars or more.
pub fn compress_user_agent(ua: &str) -> String {
    if ua.chars().count() < 20 {
        return ua.to_string();
    }
    for (needle, letter) in [("Chrome", 'C'), ("Firefox", 'F'), ("Safari", 'S'), ("Edge", 'E')] {
        if ua.contains(needle) {
            return format!("{}{}", letter, browser_version(ua, &format!("{}/", needle)));
        }
    }
    ua.chars().take(20).collect()
}

fn browser_version(ua: &str, prefix: &str) -> String {
    let Some(found) = ua.find(prefix) else { return String::new() };
    let rest = &ua[found + prefix.len()..];
    let end = rest
        .find(' ')
        .or_else(|| rest.get(3..).and_then(|tail| tail.find('.')).map(|i| i + 3))
        .unwrap_or_else(|| rest.len().min(5));
    rest.get(..end).unwrap_or(rest).to_string()
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Malformed(e.to_string()))
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Malformed(format!("gzip: {}", e)))?;
    Ok(out)
}

/// Gzipped envelope JSON, ready for a binary frame.
pub fn pack_request(style: FieldStyle, sealed: &SealedRequest) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(&style.envelope_value(sealed))
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    gzip(&json)
}

pub fn unpack_request(style: FieldStyle, bytes: &[u8]) -> Result<(Envelope, Sidecar), CodecError> {
    let value: Value = serde_json::from_slice(&gunzip(bytes)?)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    style.read_envelope(&value)
}

pub fn pack_reply(reply: &Reply) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(reply).map_err(|e| CodecError::Malformed(e.to_string()))?;
    gzip(&json)
}

pub fn unpack_reply(bytes: &[u8]) -> Result<Reply, CodecError> {
    serde_json::from_slice(&gunzip(bytes)?).map_err(|e| CodecError::Malformed(e.to_string()))
}
