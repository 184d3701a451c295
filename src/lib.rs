//! Hysteria2 proxy protocol core.
//!
//! A QUIC-based tunneling protocol that carries TCP byte streams and UDP
//! datagrams through a single authenticated QUIC connection. This crate
//! implements the protocol core on both sides: the HTTP/3-framed
//! authentication handshake with bandwidth negotiation, the per-stream TCP
//! framing with deferred responses, the UDP-over-datagram session
//! multiplexer with fragmentation, congestion controller selection
//! (Brutal or BBR), and the optional Salamander packet obfuscation layer.
//!
//! The embedder supplies the TLS configuration, the user store, the
//! upstream connection handler, and the masquerade HTTP handler; see
//! [`ClientOptions`] and [`ServiceOptions`].

pub mod address;
pub mod client;
pub mod congestion;
pub mod error;
pub mod protocol;
mod quic_stream;
pub mod resolver;
pub mod salamander;
pub mod server;
mod socket_util;
mod udp;

pub use address::{Address, NetLocation};
pub use client::{Client, ClientConnection, ClientOptions, ClientStreamConn, DirectDialer, UdpDialer};
pub use error::{HysteriaError, Result};
pub use quic_stream::QuicStream;
pub use resolver::{NativeResolver, Resolver};
pub use server::{
    MasqueradeHandler, NotFoundMasquerade, ServerHandler, ServerStreamConn, Service, ServiceOptions,
};
pub use udp::UdpPacketConn;
