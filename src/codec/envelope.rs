//! Sealed request envelopes and sealed replies.
//!
//! Request sealing, per call:
//!
//! 1. draw an [`EphemeralKey`] `K`;
//! 2. serialize the field map canonically (keys sorted);
//! 3. seal it under [`crypto::inner_key`] into `value`;
//! 4. wrap `{accessKey, secretKeyId, value, key: K}` and seal the wrapper under the service key;
//! 5. sign the canonical bytes and derive the serial from `K` and the correlation id.
//!
//! The authority seals the reply data under [`crypto::reply_key`] together with the serial it
//! was given. [`EnvelopeCodec::decode_reply`] rejects a reply that does not echo it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::crypto::{self, Cipher, EphemeralKey, KEY_LEN};
use crate::clock::unix_millis;
use crate::config::KeySettings;
use crate::error::{CodecError, ConfigError};
use crate::model::{codes, Reply, UpgradeType};

/// Canonical request fields. `BTreeMap` keeps the serialization order stable.
pub type FieldMap = BTreeMap<String, Value>;

/// Request field names.
pub mod fields {
    pub const COOKIE: &str = "x-oauth-cookie";
    pub const TOKEN: &str = "x-oauth-token";
    pub const ACCESS_KEY: &str = "x-oauth-access-key";
    pub const SUB_PROTOCOL: &str = "x-oauth-sub-protocol";
    pub const PARAM_ADDRESS: &str = "x-oauth-param-address";
    pub const PARAM_APP_NAME: &str = "x-oauth-param-app-name";
    pub const EXT_TIMESTAMP: &str = "x-ext-timestamp";
    pub const USERNAME: &str = "x-oauth-username";
    pub const PASSWORD: &str = "x-oauth-password";
    pub const AUTH_TYPE: &str = "x-oauth-auth-type";
    pub const EXT: &str = "x-oauth-ext";
    pub const UID: &str = "x-oauth-uid";
    pub const LOGOUT_TYPE: &str = "x-oauth-logout-type";
    pub const REFRESH_TOKEN: &str = "x-oauth-refresh-token";
    pub const UPGRADE_TYPE: &str = "x-oauth-upgrade-type";
    pub const USER_CODE: &str = "x-oauth-user-code";
    pub const QUERY: &str = "x-oauth-query";
}

/// Sidecar metadata names (HTTP headers, RPC metadata, frame metadata).
pub mod headers {
    pub const TIMESTAMP: &str = "x-oauth-timestamp";
    pub const UUID: &str = "x-oauth-uuid";
    pub const ENCODE: &str = "x-oauth-encode";
    pub const SERIAL: &str = "x-oauth-serial";
    pub const SIGN: &str = "x-oauth-sign";
    pub const SUB_PROTOCOL: &str = "x-oauth-sub-protocol";
    pub const UPGRADE_TYPE: &str = "x-oauth-upgrade-type";
    pub const RESPONSE_SERIAL: &str = "x-oauth-response-serial";
    pub const ACCESS_KEY: &str = "x-oauth-access-key";
}

/// What goes on the wire. Opaque to transports apart from framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ciphertext: String,
    /// Serial derived from `K`; identifies the key without revealing it.
    pub ephemeral_key_id: String,
    pub access_key: String,
    pub signature: String,
    pub timestamp: u64,
    /// Correlation id.
    pub nonce: String,
}

/// Markers that travel next to the envelope rather than inside it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub encode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_type: Option<String>,
}

/// Everything needed to open the reply to one request.
#[derive(Debug, Clone)]
pub struct ReplyKey {
    key: EphemeralKey,
    serial: String,
}

impl ReplyKey {
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

/// A sealed request plus the private half needed to read its reply.
#[derive(Debug, Clone)]
pub struct SealedRequest {
    pub envelope: Envelope,
    pub sidecar: Sidecar,
    reply: ReplyKey,
}

impl SealedRequest {
    pub fn reply_key(&self) -> &ReplyKey {
        &self.reply
    }

    /// Sidecar as `(name, value)` pairs, in a fixed order.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (headers::TIMESTAMP, self.envelope.timestamp.to_string()),
            (headers::UUID, self.envelope.nonce.clone()),
            (headers::ENCODE, self.sidecar.encode.to_string()),
            (headers::SERIAL, self.envelope.ephemeral_key_id.clone()),
            (headers::SIGN, self.envelope.signature.clone()),
            (headers::ACCESS_KEY, self.envelope.access_key.clone()),
        ];
        if let Some(sub_protocol) = &self.sidecar.sub_protocol {
            out.push((headers::SUB_PROTOCOL, sub_protocol.clone()));
        }
        if let Some(upgrade_type) = &self.sidecar.upgrade_type {
            out.push((headers::UPGRADE_TYPE, upgrade_type.clone()));
        }
        out
    }

    /// Sidecar as a JSON object, for transports that carry metadata as JSON.
    pub fn metadata(&self) -> serde_json::Map<String, Value> {
        self.headers().into_iter().map(|(k, v)| (k.to_string(), Value::String(v))).collect()
    }

    /// Rebuilds a request from wire parts. Used by the authority-side helpers.
    pub fn from_headers<'a, F>(
        ciphertext: impl Into<String>,
        lookup: F,
    ) -> Result<(Envelope, Sidecar), CodecError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let required = |name: &str| {
            lookup(name)
                .map(str::to_string)
                .ok_or_else(|| CodecError::Malformed(format!("missing {}", name)))
        };
        let envelope = Envelope {
            ciphertext: ciphertext.into(),
            ephemeral_key_id: required(headers::SERIAL)?,
            access_key: required(headers::ACCESS_KEY)?,
            signature: required(headers::SIGN)?,
            timestamp: required(headers::TIMESTAMP)?
                .parse()
                .map_err(|_| CodecError::Malformed("timestamp".into()))?,
            nonce: required(headers::UUID)?,
        };
        let sidecar = Sidecar {
            encode: lookup(headers::ENCODE).map(|v| v == "true").unwrap_or(true),
            sub_protocol: lookup(headers::SUB_PROTOCOL).map(str::to_string),
            upgrade_type: lookup(headers::UPGRADE_TYPE).map(str::to_string),
        };
        Ok((envelope, sidecar))
    }
}

/// A request opened with the service key.
#[derive(Debug, Clone)]
pub struct OpenedRequest {
    pub fields: FieldMap,
    pub reply_key: ReplyKey,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Wrapper {
    access_key: String,
    secret_key_id: String,
    value: String,
    key: String,
}

#[derive(Serialize, Deserialize)]
struct SealedBody {
    serial: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    access_key: String,
    secret_key: String,
    service_key: [u8; KEY_LEN],
    cipher: Cipher,
    encode: bool,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("access_key", &self.access_key)
            .field("cipher", &self.cipher)
            .field("encode", &self.encode)
            .finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    pub fn new(keys: &KeySettings, encode: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            access_key: keys.access_key.clone(),
            secret_key: keys.secret_key.clone(),
            service_key: crypto::service_key(&keys.service_key),
            cipher: Cipher::from_name(&keys.cipher)?,
            encode,
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn encode(
        &self,
        field_map: &FieldMap,
        upgrade_type: Option<UpgradeType>,
    ) -> Result<SealedRequest, CodecError> {
        let key = EphemeralKey::generate();
        let canonical =
            serde_json::to_vec(field_map).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let inner = crypto::inner_key(&self.access_key, &self.secret_key, &key);
        let wrapper = Wrapper {
            access_key: self.access_key.clone(),
            secret_key_id: crypto::secret_key_id(&self.secret_key),
            value: self.cipher.seal(&inner, &canonical)?,
            key: key.to_base64(),
        };
        let wrapper =
            serde_json::to_vec(&wrapper).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let ciphertext = self.cipher.seal(&self.service_key, &wrapper)?;

        let nonce = Uuid::new_v4().to_string();
        let serial = crypto::serial(&key, &nonce);
        let envelope = Envelope {
            ciphertext,
            ephemeral_key_id: serial.clone(),
            access_key: self.access_key.clone(),
            signature: crypto::sign(&self.secret_key, &canonical)?,
            timestamp: unix_millis(),
            nonce,
        };
        let sidecar = Sidecar {
            encode: self.encode,
            sub_protocol: field_map
                .get(fields::SUB_PROTOCOL)
                .and_then(Value::as_str)
                .map(str::to_string),
            upgrade_type: upgrade_type.map(|t| t.as_str().to_string()),
        };
        Ok(SealedRequest { envelope, sidecar, reply: ReplyKey { key, serial } })
    }

    /// Opens the reply to a request sealed by [`encode`](Self::encode).
    ///
    /// A string `data` is a sealed body and must echo the request serial. Structured `data` is
    /// accepted as plaintext only for non-`OK` codes or when encoding is switched off.
    pub fn decode_reply(&self, reply: Reply, pending: &ReplyKey) -> Result<Reply, CodecError> {
        match reply.data {
            Some(Value::String(sealed)) => {
                let plain = self.cipher.open(&crypto::reply_key(&pending.key), &sealed)?;
                let body: SealedBody = serde_json::from_slice(&plain)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                if body.serial != pending.serial {
                    return Err(CodecError::SerialMismatch {
                        expected: pending.serial.clone(),
                        actual: body.serial,
                    });
                }
                Ok(Reply { code: reply.code, message: reply.message, data: body.data })
            }
            Some(data) if !data.is_null() && self.encode && reply.code == codes::OK => {
                Err(CodecError::Malformed("unsealed payload in an OK reply".into()))
            }
            data => Ok(Reply { code: reply.code, message: reply.message, data }),
        }
    }

    /// Authority-side: opens a sealed request and checks signature, access key and serial.
    pub fn open_request(&self, envelope: &Envelope) -> Result<OpenedRequest, CodecError> {
        let wrapper = self.cipher.open(&self.service_key, &envelope.ciphertext)?;
        let wrapper: Wrapper =
            serde_json::from_slice(&wrapper).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if wrapper.access_key != self.access_key
            || wrapper.secret_key_id != crypto::secret_key_id(&self.secret_key)
        {
            return Err(CodecError::AccessKey);
        }

        let key = EphemeralKey::from_base64(&wrapper.key)?;
        let inner = crypto::inner_key(&self.access_key, &self.secret_key, &key);
        let canonical = self.cipher.open(&inner, &wrapper.value)?;
        crypto::verify(&self.secret_key, &canonical, &envelope.signature)?;

        let serial = crypto::serial(&key, &envelope.nonce);
        if serial != envelope.ephemeral_key_id {
            return Err(CodecError::SerialMismatch {
                expected: serial,
                actual: envelope.ephemeral_key_id.clone(),
            });
        }
        let fields: FieldMap =
            serde_json::from_slice(&canonical).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(OpenedRequest { fields, reply_key: ReplyKey { key, serial } })
    }

    /// Authority-side: seals `reply.data` for the caller holding `reply_key`.
    pub fn seal_reply(&self, reply: Reply, reply_key: &ReplyKey) -> Result<Reply, CodecError> {
        let body = SealedBody { serial: reply_key.serial.clone(), data: reply.data };
        let plain = serde_json::to_vec(&body).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let sealed = self.cipher.seal(&crypto::reply_key(&reply_key.key), &plain)?;
        Ok(Reply { code: reply.code, message: reply.message, data: Some(Value::String(sealed)) })
    }
}
