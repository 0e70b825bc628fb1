//! Envelope sealing, signing and compact wire encodings.

pub mod compact;
pub mod crypto;
pub mod envelope;

pub use compact::FieldStyle;
pub use crypto::{Cipher, EphemeralKey};
pub use envelope::{
    fields, headers, Envelope, EnvelopeCodec, FieldMap, OpenedRequest, ReplyKey, SealedRequest,
    Sidecar,
};
