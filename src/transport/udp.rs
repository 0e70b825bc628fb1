//! Single-datagram binding.
//!
//! Packet: `[magic: u16 = 0xABCD][version: u8 = 1][type: u8][sequence: u16][length: u16][payload]`,
//! all big-endian. Payloads use the UDP short names and must keep the whole packet within
//! [`MAX_PACKET`]; anything larger is a configuration problem, not an authority failure.
//!
//! Port is the HTTP port + 2 (8082 when the address has none). Every call binds a fresh socket.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;

use super::tcp::{read_reply_frame, request_type};
use super::{within, Operation, OutboundRequest, Received, Transport, TransportSettings};
use crate::codec::compact::{self, FieldStyle};
use crate::error::{ConfigError, TransportError};
use crate::model::Reply;
use crate::selector::Endpoint;

pub const MAGIC: u16 = 0xABCD;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET: usize = 1400;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: u8,
    pub sequence: u16,
    pub length: u16,
}

pub fn encode_packet(kind: u8, sequence: u16, payload: &[u8]) -> Result<BytesMut, TransportError> {
    let size = HEADER_LEN + payload.len();
    if size > MAX_PACKET {
        return Err(ConfigError::PayloadTooLarge { size, limit: MAX_PACKET }.into());
    }
    let mut packet = BytesMut::with_capacity(size);
    packet.put_u16(MAGIC);
    packet.put_u8(VERSION);
    packet.put_u8(kind);
    packet.put_u16(sequence);
    // Bounded by MAX_PACKET above.
    packet.put_u16(payload.len() as u16);
    packet.put_slice(payload);
    Ok(packet)
}

/// Splits a datagram into header and payload.
pub fn decode_packet(mut packet: &[u8]) -> Result<(PacketHeader, &[u8]), TransportError> {
    if packet.len() < HEADER_LEN {
        return Err(TransportError::Frame(format!("datagram of {} bytes", packet.len())));
    }
    let magic = packet.get_u16();
    if magic != MAGIC {
        return Err(TransportError::Frame(format!("bad magic 0x{:04x}", magic)));
    }
    let version = packet.get_u8();
    if version != VERSION {
        return Err(TransportError::Frame(format!("unsupported protocol version {}", version)));
    }
    let header =
        PacketHeader { kind: packet.get_u8(), sequence: packet.get_u16(), length: packet.get_u16() };
    let payload = packet
        .get(..usize::from(header.length))
        .ok_or_else(|| TransportError::Frame("datagram shorter than its length field".into()))?;
    Ok((header, payload))
}

#[derive(Debug)]
pub struct UdpTransport {
    sequence: AtomicU16,
    read_timeout: Duration,
}

impl UdpTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        Self { sequence: AtomicU16::new(0), read_timeout: settings.timeouts.read() }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn supports(&self, operation: Operation) -> bool {
        request_type(operation).is_some()
    }

    fn field_style(&self) -> FieldStyle {
        FieldStyle::Udp
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Received, TransportError> {
        let kind = request_type(request.operation).ok_or_else(|| {
            TransportError::Frame(format!("{} has no udp packet type", request.operation))
        })?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let payload = compact::pack_request(FieldStyle::Udp, request.sealed()?)?;
        let packet = encode_packet(kind, sequence, &payload)?;

        let address = format!("{}:{}", endpoint.host(), endpoint.udp_port());
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&address).await?;
        socket.send(&packet).await?;

        let mut buffer = vec![0u8; MAX_PACKET];
        let received =
            within("udp read", self.read_timeout, async { Ok(socket.recv(&mut buffer).await?) })
                .await?;
        let (header, body) = decode_packet(&buffer[..received])?;
        if header.sequence != sequence {
            tracing::warn!(
                target: "authwire::udp",
                expected = sequence,
                actual = header.sequence,
                "reply sequence mismatch"
            );
        }
        let reply: Reply = read_reply_frame(header.kind, body)?;
        Ok(Received::Sealed(reply))
    }
}
