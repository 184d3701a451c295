//! Salamander UDP obfuscation.
//!
//! A packet-level XOR mask over every UDP datagram, keyed by a shared
//! password and a per-packet salt. Not authenticated encryption: the QUIC
//! layer underneath provides integrity, this layer only defeats
//! pattern-matching middleboxes.
//!
//! Wire format: `salt(8) || payload XOR keystream(password, salt)`, where
//! the keystream is `H(password || salt)` extended by iterated re-hashing.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use aws_lc_rs::digest;
use futures::ready;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use rand::RngCore;

pub const SALT_LENGTH: usize = 8;

fn apply_keystream(password: &[u8], salt: &[u8], data: &mut [u8]) {
    if data.is_empty() {
        return;
    }
    let mut material = Vec::with_capacity(password.len() + salt.len());
    material.extend_from_slice(password);
    material.extend_from_slice(salt);

    let mut block = digest::digest(&digest::SHA256, &material);
    let mut offset = 0;
    loop {
        let key = block.as_ref();
        for (byte, k) in data[offset..].iter_mut().zip(key.iter()) {
            *byte ^= *k;
        }
        offset += key.len();
        if offset >= data.len() {
            return;
        }
        block = digest::digest(&digest::SHA256, key);
    }
}

/// Obfuscates one outbound packet: fresh salt, keystream XOR, salt prefix.
pub fn obfuscate(password: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; SALT_LENGTH + payload.len()];
    rand::rng().fill_bytes(&mut packet[..SALT_LENGTH]);
    packet[SALT_LENGTH..].copy_from_slice(payload);
    let (salt, data) = packet.split_at_mut(SALT_LENGTH);
    apply_keystream(password, salt, data);
    packet
}

/// Reverses [`obfuscate`] in place, returning the payload length, or `None`
/// for packets too short to carry a salt (which are dropped).
pub fn deobfuscate_in_place(password: &[u8], packet: &mut [u8]) -> Option<usize> {
    if packet.len() < SALT_LENGTH {
        return None;
    }
    let (salt, data) = packet.split_at_mut(SALT_LENGTH);
    apply_keystream(password, salt, data);
    let payload_len = data.len();
    packet.copy_within(SALT_LENGTH.., 0);
    Some(payload_len)
}

/// A QUIC-facing UDP socket that applies Salamander obfuscation to every
/// packet in both directions. Wraps the socket before the endpoint ever
/// sees it, so the QUIC stack is oblivious to the masking.
pub struct SalamanderSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    password: Box<[u8]>,
}

impl SalamanderSocket {
    pub fn new(inner: Arc<dyn AsyncUdpSocket>, password: &[u8]) -> Self {
        Self {
            inner,
            password: password.into(),
        }
    }

    /// Deobfuscates one receive buffer, handling coalesced (GRO) segments:
    /// every segment carries its own salt, and stripping the salts shrinks
    /// the stride by [`SALT_LENGTH`].
    fn decode_buffer(&self, buf: &mut [u8], meta: &mut RecvMeta) {
        let total = meta.len;
        let stride = meta.stride;
        if total == 0 || stride == 0 {
            meta.len = 0;
            return;
        }

        let mut read = 0;
        let mut write = 0;
        while read < total {
            let segment_len = stride.min(total - read);
            if segment_len < SALT_LENGTH {
                break;
            }
            let segment = &mut buf[read..read + segment_len];
            let (salt, data) = segment.split_at_mut(SALT_LENGTH);
            apply_keystream(&self.password, salt, data);
            buf.copy_within(read + SALT_LENGTH..read + segment_len, write);
            write += segment_len - SALT_LENGTH;
            read += segment_len;
        }

        meta.len = write;
        meta.stride = stride.saturating_sub(SALT_LENGTH);
    }
}

impl fmt::Debug for SalamanderSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SalamanderSocket")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl AsyncUdpSocket for SalamanderSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let contents = obfuscate(&self.password, transmit.contents);
        self.inner.try_send(&Transmit {
            destination: transmit.destination,
            ecn: transmit.ecn,
            contents: &contents,
            segment_size: None,
            src_ip: transmit.src_ip,
        })
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let count = ready!(self.inner.poll_recv(cx, bufs, meta))?;
        for (buf, meta) in bufs.iter_mut().zip(meta.iter_mut()).take(count) {
            self.decode_buffer(buf, meta);
        }
        Poll::Ready(Ok(count))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    // each datagram needs its own salt, so never hand this socket GSO
    // batches.
    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}
