//! UDP session multiplexing over QUIC datagrams.
//!
//! Each QUIC connection carries any number of logical UDP sockets,
//! distinguished by session id. Outbound packets are fragmented to fit the
//! connection's current datagram size; inbound fragments are reassembled
//! per `(session_id, packet_id)` and delivered to the owning session's
//! queue. Both the client and the server drive the same table, from
//! opposite directions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;

use crate::address::NetLocation;
use crate::error::{from_connection_error, HysteriaError, Result};
use crate::protocol::{self, UdpMessage};

/// Per-session delivery queue depth. Overflow drops packets instead of
/// blocking the connection's datagram loop.
const SESSION_QUEUE_SIZE: usize = 64;

/// In-flight reassembly entries per session. Inserting past this evicts
/// the oldest incomplete packet.
const MAX_PENDING_PACKETS: usize = 64;

struct FragmentedPacket {
    frag_count: u8,
    frag_received: u8,
    total_len: usize,
    received: Vec<Option<Bytes>>,
}

/// Reassembles fragment payloads keyed by packet id.
pub(crate) struct Defragger {
    pending: HashMap<u16, FragmentedPacket>,
    // insertion order of pending packet ids; may contain ids already
    // resolved, which eviction skips over
    order: VecDeque<u16>,
}

impl Defragger {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Feeds one fragment. Returns the whole packet payload once every
    /// fragment of its packet id has arrived.
    pub(crate) fn feed(&mut self, msg: UdpMessage) -> Option<Bytes> {
        if msg.frag_count == 1 {
            return Some(msg.payload);
        }

        match self.pending.get(&msg.packet_id).map(|p| p.frag_count) {
            Some(existing) if existing != msg.frag_count => {
                debug!(
                    "mismatched fragment count for packet {}, dropping",
                    msg.packet_id
                );
                self.pending.remove(&msg.packet_id);
                return None;
            }
            Some(_) => {}
            None => {
                if self.pending.len() >= MAX_PENDING_PACKETS {
                    self.evict_oldest();
                }
                self.order.push_back(msg.packet_id);
                self.pending.insert(
                    msg.packet_id,
                    FragmentedPacket {
                        frag_count: msg.frag_count,
                        frag_received: 0,
                        total_len: 0,
                        received: vec![None; msg.frag_count as usize],
                    },
                );
            }
        }

        let entry = self.pending.get_mut(&msg.packet_id).unwrap();
        let duplicate = entry.received[msg.frag_id as usize].is_some();
        if !duplicate {
            entry.frag_received += 1;
            entry.total_len += msg.payload.len();
            entry.received[msg.frag_id as usize] = Some(msg.payload);
            if entry.frag_received != entry.frag_count {
                return None;
            }
        }
        if duplicate {
            debug!("duplicate fragment for packet {}, dropping", msg.packet_id);
            self.pending.remove(&msg.packet_id);
            return None;
        }

        let packet = self.pending.remove(&msg.packet_id).unwrap();
        let mut payload = BytesMut::with_capacity(packet.total_len);
        for fragment in packet.received {
            payload.extend_from_slice(&fragment.unwrap());
        }
        Some(payload.freeze())
    }

    fn evict_oldest(&mut self) {
        while let Some(old_id) = self.order.pop_front() {
            if self.pending.remove(&old_id).is_some() {
                debug!("reassembly buffer full, evicting packet {}", old_id);
                return;
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) struct UdpSessionEntry {
    sender: mpsc::Sender<(Bytes, NetLocation)>,
    defrag: Mutex<Defragger>,
}

impl UdpSessionEntry {
    fn handle(&self, msg: UdpMessage) {
        let address = msg.address.clone();
        let payload = match self.defrag.lock().unwrap().feed(msg) {
            Some(payload) => payload,
            None => return,
        };
        let location = match NetLocation::from_str(&address, None) {
            Ok(location) => location,
            Err(e) => {
                debug!("dropping packet with unparsable address {}: {}", address, e);
                return;
            }
        };
        // udp semantics: a full queue drops the packet
        let _ = self.sender.try_send((payload, location));
    }
}

/// The per-connection table of live UDP sessions.
pub(crate) struct UdpSessionTable {
    sessions: Arc<DashMap<u32, UdpSessionEntry>>,
    next_session_id: AtomicU32,
}

impl UdpSessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU32::new(0),
        }
    }

    /// Allocates a fresh session id; unique within this connection.
    pub(crate) fn allocate_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a session and returns the packet conn bound to it. The
    /// conn's close callback removes the id from this table.
    pub(crate) fn insert_session(
        &self,
        session_id: u32,
        connection: quinn::Connection,
    ) -> UdpPacketConn {
        let (sender, receiver) = mpsc::channel(SESSION_QUEUE_SIZE);
        self.sessions.insert(
            session_id,
            UdpSessionEntry {
                sender,
                defrag: Mutex::new(Defragger::new()),
            },
        );
        let sessions = self.sessions.clone();
        UdpPacketConn {
            session_id,
            connection,
            receiver: tokio::sync::Mutex::new(receiver),
            next_packet_id: AtomicU16::new(0),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(Some(Box::new(move || {
                sessions.remove(&session_id);
            }))),
        }
    }

    /// Routes a decoded message to its session. Hands the message back when
    /// the session id is unknown so the caller can apply its own policy
    /// (drop on the client, lazily create on the server).
    pub(crate) fn route(&self, msg: UdpMessage) -> Option<UdpMessage> {
        match self.sessions.get(&msg.session_id) {
            Some(entry) => {
                entry.handle(msg);
                None
            }
            None => Some(msg),
        }
    }

    /// Drops every session entry, waking blocked receivers with
    /// end-of-stream. Called when the connection's datagram loop exits.
    pub(crate) fn clear(&self) {
        self.sessions.clear();
    }
}

/// One logical UDP socket multiplexed over a QUIC connection. Reads
/// deliver `(payload, remote address)`; writes take the same pair and
/// fragment as needed. Closing (or dropping) removes the session from the
/// owning table.
pub struct UdpPacketConn {
    session_id: u32,
    connection: quinn::Connection,
    receiver: tokio::sync::Mutex<mpsc::Receiver<(Bytes, NetLocation)>>,
    next_packet_id: AtomicU16,
    closed: AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl UdpPacketConn {
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Receives the next reassembled packet addressed to this session.
    pub async fn recv_from(&self) -> Result<(Bytes, NetLocation)> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or(HysteriaError::ConnectionClosed)
    }

    /// Fragments and sends one packet toward `destination`. The maximum
    /// datagram size is re-queried on every send; fragments already on the
    /// wire when the path MTU shrinks are simply lost, as UDP allows.
    pub async fn send_to(&self, payload: &[u8], destination: &NetLocation) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HysteriaError::ConnectionClosed);
        }
        let max_size = self
            .connection
            .max_datagram_size()
            .ok_or(HysteriaError::Invalid)?;
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let msg = UdpMessage {
            session_id: self.session_id,
            packet_id,
            frag_id: 0,
            frag_count: 1,
            address: destination.to_string(),
            payload: Bytes::copy_from_slice(payload),
        };
        for fragment in protocol::fragment_udp_message(msg, max_size)? {
            let data = protocol::encode_udp_message(&fragment)?;
            self.connection
                .send_datagram(data)
                .map_err(from_send_datagram_error)?;
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(on_close) = self.on_close.lock().unwrap().take() {
            on_close();
        }
    }
}

impl Drop for UdpPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

fn from_send_datagram_error(err: quinn::SendDatagramError) -> HysteriaError {
    match err {
        quinn::SendDatagramError::ConnectionLost(e) => from_connection_error(e),
        quinn::SendDatagramError::UnsupportedByPeer => HysteriaError::UdpDisabledByServer,
        quinn::SendDatagramError::Disabled => HysteriaError::Invalid,
        quinn::SendDatagramError::TooLarge => {
            HysteriaError::Io(std::io::Error::other("datagram too large"))
        }
    }
}

/// Decodes a raw datagram, logging and discarding malformed ones.
pub(crate) fn decode_datagram(data: Bytes) -> Option<UdpMessage> {
    match protocol::decode_udp_message(data) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("dropping malformed datagram: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment_udp_message;

    fn fragment(packet_id: u16, frag_id: u8, frag_count: u8, payload: &[u8]) -> UdpMessage {
        UdpMessage {
            session_id: 1,
            packet_id,
            frag_id,
            frag_count,
            address: "8.8.8.8:53".to_string(),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_single_fragment_is_delivered_directly() {
        let mut defrag = Defragger::new();
        let payload = defrag.feed(fragment(0, 0, 1, b"hello")).unwrap();
        assert_eq!(&payload[..], b"hello");
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn test_reassembly_in_arrival_order_independent_of_frag_id() {
        let mut defrag = Defragger::new();
        assert!(defrag.feed(fragment(7, 2, 3, b"cc")).is_none());
        assert!(defrag.feed(fragment(7, 0, 3, b"aa")).is_none());
        let payload = defrag.feed(fragment(7, 1, 3, b"bb")).unwrap();
        assert_eq!(&payload[..], b"aabbcc");
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn test_interleaved_packets_reassemble_independently() {
        let mut defrag = Defragger::new();
        assert!(defrag.feed(fragment(1, 0, 2, b"1a")).is_none());
        assert!(defrag.feed(fragment(2, 0, 2, b"2a")).is_none());
        assert_eq!(&defrag.feed(fragment(2, 1, 2, b"2b")).unwrap()[..], b"2a2b");
        assert_eq!(&defrag.feed(fragment(1, 1, 2, b"1b")).unwrap()[..], b"1a1b");
    }

    #[test]
    fn test_mismatched_fragment_count_drops_packet() {
        let mut defrag = Defragger::new();
        assert!(defrag.feed(fragment(3, 0, 2, b"x")).is_none());
        assert!(defrag.feed(fragment(3, 1, 3, b"y")).is_none());
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn test_duplicate_fragment_drops_packet() {
        let mut defrag = Defragger::new();
        assert!(defrag.feed(fragment(4, 0, 2, b"x")).is_none());
        assert!(defrag.feed(fragment(4, 0, 2, b"x")).is_none());
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_incomplete_packet() {
        let mut defrag = Defragger::new();
        for packet_id in 0..MAX_PENDING_PACKETS as u16 {
            assert!(defrag.feed(fragment(packet_id, 0, 2, b"x")).is_none());
        }
        assert_eq!(defrag.pending_len(), MAX_PENDING_PACKETS);

        // a fresh packet id evicts packet 0, the oldest
        assert!(defrag.feed(fragment(9999, 0, 2, b"y")).is_none());
        assert_eq!(defrag.pending_len(), MAX_PENDING_PACKETS);

        // packet 1 was not evicted and still completes
        assert_eq!(&defrag.feed(fragment(1, 1, 2, b"y")).unwrap()[..], b"xy");

        // packet 0 is gone: its second fragment starts a new packet
        // instead of completing the old one
        assert!(defrag.feed(fragment(0, 1, 2, b"x")).is_none());
    }

    #[test]
    fn test_defrag_round_trip_through_fragmenter() {
        let payload: Vec<u8> = (0..4000).map(|i| i as u8).collect();
        let msg = UdpMessage {
            session_id: 5,
            packet_id: 42,
            frag_id: 0,
            frag_count: 1,
            address: "example.com:443".to_string(),
            payload: Bytes::from(payload.clone()),
        };
        let fragments = fragment_udp_message(msg, 1200).unwrap();
        assert!(fragments.len() >= 4);

        let mut defrag = Defragger::new();
        let mut result = None;
        for fragment in fragments {
            assert!(result.is_none());
            result = defrag.feed(fragment);
        }
        assert_eq!(&result.unwrap()[..], &payload[..]);
    }

    #[test]
    fn test_session_id_allocation_is_unique() {
        let table = UdpSessionTable::new();
        let a = table.allocate_id();
        let b = table.allocate_id();
        let c = table.allocate_id();
        assert!(a != b && b != c && a != c);
    }
}
