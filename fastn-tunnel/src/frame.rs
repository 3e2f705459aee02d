//! Tunnel frame codec.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! 0       2             4               6                8
//! +-------+-------------+---------------+----------------+-------------
//! | magic | packet type | connection id | payload length | payload ...
//! +-------+-------------+---------------+----------------+-------------
//! ```
//!
//! All header fields are big-endian u16. For [`PacketType::RequestTunnel`]
//! the connection id carries the target TCP port instead.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fastn_tunnel_net::PeerId;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC: u16 = 0xA26A;
pub const HEADER_SIZE: usize = 8;

/// Largest frame the header can describe.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Pong = 0x0100,
    Ping = 0x0108,
    TcpData = 0x0600,
    TcpFin = 0x0601,
    RequestTunnel = 0x0602,
    AckTunnel = 0x0610,
    /// Sent by the acceptor when it cannot reach the requested target.
    RejectTunnel = 0x0611,
}

impl PacketType {
    pub const ALL: [PacketType; 7] = [
        PacketType::Pong,
        PacketType::Ping,
        PacketType::TcpData,
        PacketType::TcpFin,
        PacketType::RequestTunnel,
        PacketType::AckTunnel,
        PacketType::RejectTunnel,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u16 == value)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketType::Pong => "PONG",
            PacketType::Ping => "PING",
            PacketType::TcpData => "TCP_DATA",
            PacketType::TcpFin => "TCP_FIN",
            PacketType::RequestTunnel => "REQUEST_TUNNEL",
            PacketType::AckTunnel => "ACK_TUNNEL",
            PacketType::RejectTunnel => "REJECT_TUNNEL",
        };
        f.write_str(name)
    }
}

/// A decoded frame. The payload borrows from the transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub payload: &'a [u8],
    /// Sender as authenticated by the transport.
    pub origin: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes is shorter than the 8 byte header")]
    TooShort { len: usize },

    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    #[error("header declares {declared} payload bytes but only {available} arrived")]
    LengthMismatch { declared: usize, available: usize },

    #[error("payload of {declared} bytes exceeds limit of {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    #[error("unknown packet type {0:#06x}")]
    UnknownPacketType(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("payload of {len} bytes exceeds limit of {max}")]
pub struct EncodeError {
    pub len: usize,
    pub max: usize,
}

/// Payload capacity for a transport whose messages are capped at
/// `max_message_size`.
pub fn max_payload(max_message_size: usize) -> usize {
    max_message_size.clamp(HEADER_SIZE, MAX_FRAME_SIZE) - HEADER_SIZE
}

/// Parse one transport message received from `origin`.
///
/// Structural checks run before any header field is trusted: length, then
/// magic, then declared length against what arrived, then against the limit.
/// Bytes after the declared payload are ignored.
pub fn decode(buf: &[u8], origin: PeerId, max_message_size: usize) -> Result<Frame<'_>, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort { len: buf.len() });
    }

    let mut header = &buf[..HEADER_SIZE];
    let magic = header.get_u16();
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }

    let packet_type = header.get_u16();
    let connection_id = header.get_u16();
    let declared = header.get_u16() as usize;

    let available = buf.len() - HEADER_SIZE;
    if declared > available {
        return Err(DecodeError::LengthMismatch { declared, available });
    }

    let max = max_payload(max_message_size);
    if declared > max {
        return Err(DecodeError::PayloadTooLarge { declared, max });
    }

    let packet_type =
        PacketType::from_u16(packet_type).ok_or(DecodeError::UnknownPacketType(packet_type))?;

    Ok(Frame {
        packet_type,
        connection_id,
        payload: &buf[HEADER_SIZE..HEADER_SIZE + declared],
        origin,
    })
}

/// Outgoing frame under construction.
///
/// The header region is reserved up front and only written by
/// [`FrameBuf::encode`], so socket reads land directly in the payload region
/// and the finished frame goes to the transport without another copy.
#[derive(Debug)]
pub struct FrameBuf {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameBuf {
    pub fn new(max_payload: usize) -> Self {
        let max_payload = max_payload.min(u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + max_payload);
        buf.put_bytes(0, HEADER_SIZE);
        Self { buf, max_payload }
    }

    /// Encode a frame whose payload is already in hand.
    pub fn build(
        packet_type: PacketType,
        connection_id: u16,
        payload: &[u8],
        max_payload: usize,
    ) -> Result<Bytes, EncodeError> {
        let mut frame = Self::new(max_payload);
        frame.push_payload(payload)?;
        Ok(frame.encode(packet_type, connection_id))
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    /// Bytes the payload region can still take.
    pub fn remaining(&self) -> usize {
        self.max_payload - self.payload_len()
    }

    pub fn push_payload(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        if bytes.len() > self.remaining() {
            return Err(EncodeError {
                len: self.payload_len() + bytes.len(),
                max: self.max_payload,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Read once from `reader` into the free part of the payload region.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream.
    pub async fn read_payload<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.remaining();
        if limit == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame payload region is full",
            ));
        }

        let mut region = (&mut self.buf).limit(limit);
        reader.read_buf(&mut region).await
    }

    /// Write the header in front of the payload and hand the frame over.
    pub fn encode(mut self, packet_type: PacketType, connection_id: u16) -> Bytes {
        // push_payload and read_payload keep the payload within u16 range
        let len = self.payload_len() as u16;
        let mut header = &mut self.buf[..HEADER_SIZE];
        header.put_u16(MAGIC);
        header.put_u16(packet_type as u16);
        header.put_u16(connection_id);
        header.put_u16(len);
        self.buf.freeze()
    }
}
