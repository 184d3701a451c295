//! Wire framing for the Hysteria2 protocol.
//!
//! Protocol reference: https://v2.hysteria.network/docs/developers/Protocol/
//!
//! Three frame families share the QUIC varint format (RFC 9000 §16):
//! the HTTP/3 authentication headers, the TCP request/response frames
//! carried on bidirectional streams, and the UDP fragment frames carried
//! over QUIC datagrams.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue};
use rand::distr::Alphanumeric;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::HysteriaError;

/// HTTP/3 authentication request URI host
pub const AUTH_HOST: &str = "hysteria";

/// HTTP/3 authentication request URI path
pub const AUTH_PATH: &str = "/auth";

/// Full HTTP/3 authentication request URI
pub const AUTH_URL: &str = "https://hysteria/auth";

/// HTTP status code for successful authentication (HyOK)
pub const STATUS_AUTH_OK: u16 = 233;

/// Header names
pub mod header {
    /// Client authentication header
    pub const AUTH: &str = "Hysteria-Auth";
    /// UDP enabled response header
    pub const UDP: &str = "Hysteria-UDP";
    /// Congestion control (bandwidth) header
    pub const CC_RX: &str = "Hysteria-CC-RX";
    /// Padding header for obfuscation
    pub const PADDING: &str = "Hysteria-Padding";
}

/// CC-RX response value meaning the server leaves rate control to the
/// congestion controller.
const CC_RX_AUTO: &str = "auto";

/// TCP request frame type
pub const FRAME_TYPE_TCP_REQUEST: u64 = 0x401;

const TCP_STATUS_OK: u8 = 0x00;
const TCP_STATUS_ERROR: u8 = 0x01;

/// Maximum address length (from the reference implementation)
pub const MAX_ADDRESS_LENGTH: usize = 2048;

/// Maximum TCP response message length
pub const MAX_MESSAGE_LENGTH: usize = 2048;

/// Maximum padding length
pub const MAX_PADDING_LENGTH: usize = 4096;

/// Encodes a value as a QUIC varint.
pub fn encode_varint(value: u64) -> Result<Box<[u8]>, HysteriaError> {
    if value <= 0b00111111 {
        Ok(Box::new([value as u8]))
    } else if value < (1 << 14) {
        let mut bytes = (value as u16).to_be_bytes();
        bytes[0] |= 0b01000000;
        Ok(Box::new(bytes))
    } else if value < (1 << 30) {
        let mut bytes = (value as u32).to_be_bytes();
        bytes[0] |= 0b10000000;
        Ok(Box::new(bytes))
    } else if value < (1 << 62) {
        let mut bytes = value.to_be_bytes();
        bytes[0] |= 0b11000000;
        Ok(Box::new(bytes))
    } else {
        Err(HysteriaError::MalformedFrame(
            "value too large to encode as varint",
        ))
    }
}

fn varint_size(value: u64) -> usize {
    if value <= 0b00111111 {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Decodes a varint from the front of `buf` without consuming it. Returns
/// the value and its encoded length, or `None` when more bytes are needed.
pub fn take_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let num_bytes = 1usize << (first >> 6);
    if buf.len() < num_bytes {
        return None;
    }
    let mut value = (first & 0b00111111) as u64;
    for byte in &buf[1..num_bytes] {
        value = (value << 8) | (*byte as u64);
    }
    Some((value, num_bytes))
}

fn read_error(err: std::io::Error) -> HysteriaError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        HysteriaError::MalformedFrame("short read")
    } else {
        HysteriaError::Io(err)
    }
}

/// Reads a varint from a byte stream.
pub async fn read_varint<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u64, HysteriaError> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await.map_err(read_error)?;
    let num_bytes = 1usize << (first[0] >> 6);
    let mut value = (first[0] & 0b00111111) as u64;
    if num_bytes > 1 {
        let mut remaining = [0u8; 7];
        stream
            .read_exact(&mut remaining[..num_bytes - 1])
            .await
            .map_err(read_error)?;
        for byte in &remaining[..num_bytes - 1] {
            value = (value << 8) | (*byte as u64);
        }
    }
    Ok(value)
}

/// Generates the random alphanumeric value carried in `Hysteria-Padding`
/// headers.
fn padding_string() -> String {
    let mut rng = rand::rng();
    let length = rng.random_range(1..80);
    rng.sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Random binary padding for stream frames. Bounded to 63 bytes so the
/// length varint always fits in one byte.
fn padding_bytes() -> Vec<u8> {
    let mut rng = rand::rng();
    let length = rng.random_range(0..=63usize);
    let mut padding = vec![0u8; length];
    rng.fill_bytes(&mut padding);
    padding
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Opaque password; the server looks it up in its user map.
    pub auth: String,
    /// Client's desired receive rate in bits per second; 0 means automatic.
    pub rx: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthResponse {
    pub udp_enabled: bool,
    /// Server's receive rate in bits per second; meaningless when `rx_auto`.
    pub rx: u64,
    /// When set, the client should leave rate control to the congestion
    /// controller instead of pacing at `rx`.
    pub rx_auto: bool,
}

pub fn auth_request_to_headers(
    headers: &mut HeaderMap,
    request: &AuthRequest,
) -> Result<(), HysteriaError> {
    let auth = HeaderValue::from_str(&request.auth)
        .map_err(|_| HysteriaError::MalformedFrame("password not encodable as header value"))?;
    headers.insert(header::AUTH, auth);
    headers.insert(
        header::CC_RX,
        HeaderValue::from_str(&request.rx.to_string()).unwrap(),
    );
    headers.insert(
        header::PADDING,
        HeaderValue::from_str(&padding_string()).unwrap(),
    );
    Ok(())
}

/// Decodes an [`AuthRequest`]. Absent or unparsable headers decode to zero
/// values; validity is the caller's concern (an empty password simply never
/// matches a user).
pub fn auth_request_from_headers(headers: &HeaderMap) -> AuthRequest {
    let auth = headers
        .get(header::AUTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let rx = headers
        .get(header::CC_RX)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    AuthRequest { auth, rx }
}

pub fn auth_response_to_headers(headers: &mut HeaderMap, response: &AuthResponse) {
    headers.insert(
        header::UDP,
        HeaderValue::from_static(if response.udp_enabled { "true" } else { "false" }),
    );
    let cc_rx = if response.rx_auto {
        CC_RX_AUTO.to_string()
    } else {
        response.rx.to_string()
    };
    headers.insert(header::CC_RX, HeaderValue::from_str(&cc_rx).unwrap());
    headers.insert(
        header::PADDING,
        HeaderValue::from_str(&padding_string()).unwrap(),
    );
}

pub fn auth_response_from_headers(headers: &HeaderMap) -> AuthResponse {
    let udp_enabled = headers
        .get(header::UDP)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let cc_rx = headers
        .get(header::CC_RX)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let rx_auto = cc_rx.eq_ignore_ascii_case(CC_RX_AUTO);
    let rx = if rx_auto {
        0
    } else {
        cc_rx.parse::<u64>().unwrap_or(0)
    };
    AuthResponse {
        udp_enabled,
        rx,
        rx_auto,
    }
}

/// Builds the first frame of a TCP proxy stream, carrying the caller's
/// first payload bytes as the initial chunk.
pub fn write_tcp_request(destination: &str, payload: &[u8]) -> Result<Bytes, HysteriaError> {
    let address = destination.as_bytes();
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(HysteriaError::MalformedFrame("address too long"));
    }
    let padding = padding_bytes();

    let mut buf = BytesMut::with_capacity(2 + 2 + address.len() + 1 + padding.len() + payload.len());
    buf.extend_from_slice(&encode_varint(FRAME_TYPE_TCP_REQUEST)?);
    buf.extend_from_slice(&encode_varint(address.len() as u64)?);
    buf.extend_from_slice(address);
    buf.extend_from_slice(&encode_varint(padding.len() as u64)?);
    buf.extend_from_slice(&padding);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Reads a full TCP request frame, including the frame type varint, and
/// returns the destination string.
pub async fn read_tcp_request<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<String, HysteriaError> {
    let frame_type = read_varint(stream).await?;
    if frame_type != FRAME_TYPE_TCP_REQUEST {
        return Err(HysteriaError::MalformedFrame("not a TCP request frame"));
    }
    read_tcp_request_fields(stream).await
}

/// Reads the TCP request fields that follow the frame type varint. Used by
/// the server, which has already consumed the frame type while deciding
/// whether to hijack the stream.
pub(crate) async fn read_tcp_request_fields<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<String, HysteriaError> {
    let address_len = read_varint(stream).await? as usize;
    if address_len == 0 || address_len > MAX_ADDRESS_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid address length"));
    }
    let mut address = vec![0u8; address_len];
    stream.read_exact(&mut address).await.map_err(read_error)?;
    let address = String::from_utf8(address)
        .map_err(|_| HysteriaError::MalformedFrame("address is not valid UTF-8"))?;

    let padding_len = read_varint(stream).await? as usize;
    if padding_len > MAX_PADDING_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid padding length"));
    }
    if padding_len > 0 {
        let mut padding = vec![0u8; padding_len];
        stream.read_exact(&mut padding).await.map_err(read_error)?;
    }

    Ok(address)
}

/// Builds the TCP response frame, optionally carrying the first payload
/// bytes as the initial chunk.
pub fn write_tcp_response(ok: bool, message: &str, payload: &[u8]) -> Result<Bytes, HysteriaError> {
    let message = message.as_bytes();
    if message.len() > MAX_MESSAGE_LENGTH {
        return Err(HysteriaError::MalformedFrame("message too long"));
    }
    let padding = padding_bytes();

    let mut buf = BytesMut::with_capacity(1 + 2 + message.len() + 1 + padding.len() + payload.len());
    buf.put_u8(if ok { TCP_STATUS_OK } else { TCP_STATUS_ERROR });
    buf.extend_from_slice(&encode_varint(message.len() as u64)?);
    buf.extend_from_slice(message);
    buf.extend_from_slice(&encode_varint(padding.len() as u64)?);
    buf.extend_from_slice(&padding);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Reads a full TCP response frame and returns `(ok, message)`.
pub async fn read_tcp_response<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(bool, String), HysteriaError> {
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await.map_err(read_error)?;
    if status[0] != TCP_STATUS_OK && status[0] != TCP_STATUS_ERROR {
        return Err(HysteriaError::MalformedFrame("invalid response status"));
    }

    let message_len = read_varint(stream).await? as usize;
    if message_len > MAX_MESSAGE_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid message length"));
    }
    let mut message = vec![0u8; message_len];
    stream.read_exact(&mut message).await.map_err(read_error)?;

    let padding_len = read_varint(stream).await? as usize;
    if padding_len > MAX_PADDING_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid padding length"));
    }
    if padding_len > 0 {
        let mut padding = vec![0u8; padding_len];
        stream.read_exact(&mut padding).await.map_err(read_error)?;
    }

    Ok((
        status[0] == TCP_STATUS_OK,
        String::from_utf8_lossy(&message).into_owned(),
    ))
}

/// Incremental TCP response decoder for poll-based readers. Consumes the
/// frame from `buf` and returns `(ok, message)` once the whole frame is
/// buffered; returns `Ok(None)` when more bytes are needed. Bytes left in
/// `buf` afterwards are stream payload.
pub fn try_decode_tcp_response(buf: &mut BytesMut) -> Result<Option<(bool, String)>, HysteriaError> {
    let bytes = &buf[..];
    let Some(&status) = bytes.first() else {
        return Ok(None);
    };
    if status != TCP_STATUS_OK && status != TCP_STATUS_ERROR {
        return Err(HysteriaError::MalformedFrame("invalid response status"));
    }
    let mut idx = 1;

    let Some((message_len, n)) = take_varint(&bytes[idx..]) else {
        return Ok(None);
    };
    let message_len = message_len as usize;
    if message_len > MAX_MESSAGE_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid message length"));
    }
    idx += n;
    if bytes.len() < idx + message_len {
        return Ok(None);
    }
    let message = String::from_utf8_lossy(&bytes[idx..idx + message_len]).into_owned();
    idx += message_len;

    let Some((padding_len, n)) = take_varint(&bytes[idx..]) else {
        return Ok(None);
    };
    let padding_len = padding_len as usize;
    if padding_len > MAX_PADDING_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid padding length"));
    }
    idx += n;
    if bytes.len() < idx + padding_len {
        return Ok(None);
    }
    idx += padding_len;

    let _ = buf.split_to(idx);
    Ok(Some((status == TCP_STATUS_OK, message)))
}

/// One UDP datagram frame: a whole proxied packet, or one fragment of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    pub session_id: u32,
    pub packet_id: u16,
    pub frag_id: u8,
    pub frag_count: u8,
    pub address: String,
    pub payload: Bytes,
}

impl UdpMessage {
    fn header_size(&self) -> usize {
        4 + 2 + 1 + 1 + varint_size(self.address.len() as u64) + self.address.len()
    }

    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }
}

pub fn encode_udp_message(msg: &UdpMessage) -> Result<Bytes, HysteriaError> {
    let address = msg.address.as_bytes();
    if address.is_empty() || address.len() > MAX_ADDRESS_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid address length"));
    }
    let mut buf = BytesMut::with_capacity(msg.encoded_size());
    buf.put_u32(msg.session_id);
    buf.put_u16(msg.packet_id);
    buf.put_u8(msg.frag_id);
    buf.put_u8(msg.frag_count);
    buf.extend_from_slice(&encode_varint(address.len() as u64)?);
    buf.extend_from_slice(address);
    buf.extend_from_slice(&msg.payload);
    Ok(buf.freeze())
}

pub fn decode_udp_message(data: Bytes) -> Result<UdpMessage, HysteriaError> {
    if data.len() < 9 {
        return Err(HysteriaError::MalformedFrame("datagram too short"));
    }
    let session_id = u32::from_be_bytes(data[0..4].try_into().unwrap());
    let packet_id = u16::from_be_bytes(data[4..6].try_into().unwrap());
    let frag_id = data[6];
    let frag_count = data[7];
    if frag_count == 0 || frag_id >= frag_count {
        return Err(HysteriaError::MalformedFrame("impossible fragment ids"));
    }

    let (address_len, varint_len) = take_varint(&data[8..])
        .ok_or(HysteriaError::MalformedFrame("truncated address length"))?;
    let address_len = address_len as usize;
    if address_len == 0 || address_len > MAX_ADDRESS_LENGTH {
        return Err(HysteriaError::MalformedFrame("invalid address length"));
    }
    let address_start = 8 + varint_len;
    let payload_start = address_start + address_len;
    if data.len() < payload_start {
        return Err(HysteriaError::MalformedFrame("truncated address"));
    }
    let address = std::str::from_utf8(&data[address_start..payload_start])
        .map_err(|_| HysteriaError::MalformedFrame("address is not valid UTF-8"))?
        .to_string();
    let payload = data.slice(payload_start..);

    Ok(UdpMessage {
        session_id,
        packet_id,
        frag_id,
        frag_count,
        address,
        payload,
    })
}

/// Splits `msg` so that every encoded fragment fits in `max_size` bytes.
/// Returns the input unchanged when it already fits. All fragments share
/// `(session_id, packet_id, address)`, and concatenating their payloads in
/// `frag_id` order reproduces the original payload.
pub fn fragment_udp_message(
    msg: UdpMessage,
    max_size: usize,
) -> Result<Vec<UdpMessage>, HysteriaError> {
    if msg.encoded_size() <= max_size {
        return Ok(vec![msg]);
    }
    let overhead = msg.header_size();
    if max_size <= overhead {
        return Err(HysteriaError::MalformedFrame(
            "datagram size cannot fit fragment header",
        ));
    }
    let available = max_size - overhead;
    let count = msg.payload.len().div_ceil(available);
    if count > u8::MAX as usize {
        return Err(HysteriaError::MalformedFrame("too many fragments"));
    }

    let mut fragments = Vec::with_capacity(count);
    for frag_id in 0..count {
        let start = frag_id * available;
        let end = std::cmp::min(start + available, msg.payload.len());
        fragments.push(UdpMessage {
            session_id: msg.session_id,
            packet_id: msg.packet_id,
            frag_id: frag_id as u8,
            frag_count: count as u8,
            address: msg.address.clone(),
            payload: msg.payload.slice(start..end),
        });
    }
    Ok(fragments)
}
