//! Hysteria2 client core.
//!
//! A client lazily dials a single QUIC connection to the server, performs
//! the HTTP/3 authentication handshake, and then multiplexes proxied TCP
//! streams and UDP sessions over it. When the connection dies, the next
//! `offer` dials a fresh one.
//!
//! Go client reference: https://github.com/apernet/hysteria/blob/master/core/client/client.go

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::ready;
use log::debug;
use quinn::Runtime;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::congestion::{
    negotiate_client_tx, CongestionTuning, DynamicControllerFactory, Selection,
};
use crate::error::{from_connection_error, HysteriaError, Result};
use crate::protocol::{self, AuthRequest};
use crate::quic_stream::QuicStream;
use crate::resolver::{resolve_single_address, Resolver};
use crate::salamander::SalamanderSocket;
use crate::socket_util::new_udp_socket;
use crate::udp::{decode_datagram, UdpPacketConn, UdpSessionTable};

pub(crate) const DEFAULT_STREAM_RECEIVE_WINDOW: u64 = 8 * 1024 * 1024; // 8MB
pub(crate) const DEFAULT_CONN_RECEIVE_WINDOW: u64 = DEFAULT_STREAM_RECEIVE_WINDOW * 5 / 2; // 20MB
pub(crate) const DEFAULT_MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Produces the UDP socket a QUIC endpoint runs over.
pub trait UdpDialer: Send + Sync + std::fmt::Debug {
    fn dial_udp(&self, remote: std::net::SocketAddr) -> std::io::Result<std::net::UdpSocket>;
}

/// Binds a wildcard socket directly, optionally pinned to an interface.
#[derive(Debug, Default)]
pub struct DirectDialer {
    pub bind_interface: Option<String>,
}

impl UdpDialer for DirectDialer {
    fn dial_udp(&self, remote: std::net::SocketAddr) -> std::io::Result<std::net::UdpSocket> {
        new_udp_socket(remote.is_ipv6(), self.bind_interface.as_deref())
    }
}

/// Immutable client configuration.
pub struct ClientOptions {
    pub context: CancellationToken,
    pub dialer: Arc<dyn UdpDialer>,
    pub resolver: Arc<dyn Resolver>,
    pub server_address: NetLocation,
    /// TLS server name; falls back to the server address hostname.
    pub sni_hostname: Option<String>,
    pub brutal_debug: bool,
    /// Upper bound on local transmit rate in bits per second; 0 = no cap.
    pub send_bps: u64,
    /// Receive rate advertised to the server; 0 = automatic.
    pub receive_bps: u64,
    /// Empty disables Salamander obfuscation.
    pub salamander_password: String,
    pub password: String,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub udp_disabled: bool,
    /// Initial congestion window hint; 0 keeps the default.
    pub initial_window: u64,
}

pub struct Client {
    options: ClientOptions,
    conn: RwLock<Option<Arc<ClientConnection>>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            conn: RwLock::new(None),
        }
    }

    /// Returns the live connection, dialing a new one if the stored
    /// connection is missing or inactive. Double-checked locking keeps
    /// concurrent callers down to a single dial.
    pub async fn offer(&self) -> Result<Arc<ClientConnection>> {
        if let Some(conn) = &*self.conn.read().await {
            if conn.active() {
                return Ok(conn.clone());
            }
        }
        let mut guard = self.conn.write().await;
        if let Some(conn) = &*guard {
            if conn.active() {
                return Ok(conn.clone());
            }
        }
        let conn = self.offer_new().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn offer_new(&self) -> Result<Arc<ClientConnection>> {
        let options = &self.options;
        let server_addr = resolve_single_address(&options.resolver, &options.server_address)
            .await
            .map_err(HysteriaError::DialFailure)?;

        let socket = options
            .dialer
            .dial_udp(server_addr)
            .map_err(HysteriaError::DialFailure)?;
        let runtime = Arc::new(quinn::TokioRuntime);
        let mut wrapped: Arc<dyn quinn::AsyncUdpSocket> = runtime
            .wrap_udp_socket(socket)
            .map_err(HysteriaError::DialFailure)?;
        if !options.salamander_password.is_empty() {
            wrapped = Arc::new(SalamanderSocket::new(
                wrapped,
                options.salamander_password.as_bytes(),
            ));
        }

        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            None,
            wrapped,
            runtime,
        )
        .map_err(HysteriaError::DialFailure)?;

        let tuning = CongestionTuning::new();
        let client_config = self.build_client_config(&tuning)?;
        let server_name = options
            .sni_hostname
            .as_deref()
            .or_else(|| options.server_address.address().hostname())
            .unwrap_or("example.com")
            .to_string();

        debug!(
            "connecting to {} ({})",
            options.server_address, server_addr
        );
        let connecting = endpoint
            .connect_with(client_config, server_addr, &server_name)
            .map_err(|e| HysteriaError::DialFailure(std::io::Error::other(e)))?;
        let connection = match connecting.await {
            Ok(connection) => connection,
            Err(quinn::ConnectionError::TransportError(e)) => {
                return Err(HysteriaError::TlsFailure(e.to_string()));
            }
            Err(e) => return Err(from_connection_error(e)),
        };

        let response = match self.authenticate(&connection).await {
            Ok(response) => response,
            Err(e) => {
                connection.close(0u32.into(), b"");
                endpoint.close(0u32.into(), b"");
                return Err(e);
            }
        };

        let selection = negotiate_client_tx(&response, options.send_bps);
        tuning.install(selection);
        match selection {
            Selection::Brutal(rate) => debug!("authenticated, brutal tx at {} bps", rate),
            Selection::Bbr => debug!("authenticated, bbr tx"),
        }

        let conn = Arc::new(ClientConnection {
            connection,
            endpoint,
            done: CancellationToken::new(),
            close_err: Mutex::new(None),
            closed: AtomicBool::new(false),
            udp_disabled: options.udp_disabled || !response.udp_enabled,
            sessions: UdpSessionTable::new(),
            tuning,
        });
        if !conn.udp_disabled {
            tokio::spawn(conn.clone().loop_messages());
        }
        {
            // root context cancellation closes the connection
            let conn = conn.clone();
            let context = options.context.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = context.cancelled() => conn.close_with_error(HysteriaError::Cancelled),
                    _ = conn.done.cancelled() => {}
                }
            });
        }
        Ok(conn)
    }

    async fn authenticate(&self, connection: &quinn::Connection) -> Result<protocol::AuthResponse> {
        let h3_connection = h3_quinn::Connection::new(connection.clone());
        let (_h3_driver, mut send_request) = h3::client::new(h3_connection)
            .await
            .map_err(h3_error)?;

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(protocol::AUTH_URL)
            .body(())
            .map_err(|e| HysteriaError::Io(std::io::Error::other(e)))?;
        protocol::auth_request_to_headers(
            request.headers_mut(),
            &AuthRequest {
                auth: self.options.password.clone(),
                rx: self.options.receive_bps,
            },
        )?;

        let mut stream = send_request.send_request(request).await.map_err(h3_error)?;
        stream.finish().await.map_err(h3_error)?;

        let response = stream.recv_response().await.map_err(h3_error)?;
        let status = response.status().as_u16();
        if status != protocol::STATUS_AUTH_OK {
            return Err(HysteriaError::AuthenticationFailed { status });
        }
        Ok(protocol::auth_response_from_headers(response.headers()))
    }

    fn build_client_config(&self, tuning: &Arc<CongestionTuning>) -> Result<quinn::ClientConfig> {
        let tls_config = if self.options.tls_config.alpn_protocols.is_empty() {
            let mut config = (*self.options.tls_config).clone();
            config.alpn_protocols = vec![b"h3".to_vec()];
            Arc::new(config)
        } else {
            self.options.tls_config.clone()
        };
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| HysteriaError::TlsFailure(e.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport
            .max_idle_timeout(Some(DEFAULT_MAX_IDLE_TIMEOUT.try_into().unwrap()))
            .keep_alive_interval(Some(DEFAULT_KEEP_ALIVE_PERIOD))
            .stream_receive_window(quinn::VarInt::from_u64(DEFAULT_STREAM_RECEIVE_WINDOW).unwrap())
            .receive_window(quinn::VarInt::from_u64(DEFAULT_CONN_RECEIVE_WINDOW).unwrap())
            .congestion_controller_factory(Arc::new(DynamicControllerFactory::new(
                tuning.clone(),
                self.options.initial_window,
                self.options.brutal_debug,
            )));

        let mut config = quinn::ClientConfig::new(Arc::new(quic_tls));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    /// Opens a proxied TCP stream to `destination`. The request frame is
    /// deferred to the first write, and the server's response is consumed
    /// by the first read.
    pub async fn dial_conn(&self, destination: NetLocation) -> Result<ClientStreamConn> {
        let conn = self.offer().await?;
        let (send, recv) = conn
            .connection
            .open_bi()
            .await
            .map_err(from_connection_error)?;
        Ok(ClientStreamConn::new(
            QuicStream::from(send, recv),
            destination,
        ))
    }

    /// Allocates a proxied UDP session.
    pub async fn listen_packet(&self) -> Result<UdpPacketConn> {
        if self.options.udp_disabled {
            return Err(HysteriaError::Invalid);
        }
        let conn = self.offer().await?;
        if conn.udp_disabled {
            return Err(HysteriaError::UdpDisabledByServer);
        }
        let session_id = conn.sessions.allocate_id();
        Ok(conn
            .sessions
            .insert_session(session_id, conn.connection.clone()))
    }

    /// Closes the current connection, if any. The next `offer` re-dials.
    pub async fn close_with_error(&self, err: HysteriaError) {
        if let Some(conn) = &*self.conn.read().await {
            conn.close_with_error(err);
        }
    }
}

fn h3_error(err: h3::Error) -> HysteriaError {
    HysteriaError::Io(std::io::Error::other(err))
}

/// One dialed and authenticated QUIC connection.
pub struct ClientConnection {
    connection: quinn::Connection,
    // owns the raw UDP socket; closed together with the connection and
    // released when the connection is replaced
    endpoint: quinn::Endpoint,
    done: CancellationToken,
    close_err: Mutex<Option<HysteriaError>>,
    closed: AtomicBool,
    udp_disabled: bool,
    sessions: UdpSessionTable,
    tuning: Arc<CongestionTuning>,
}

impl ClientConnection {
    /// True while neither the QUIC connection nor the local done signal has
    /// fired.
    pub fn active(&self) -> bool {
        self.connection.close_reason().is_none() && !self.done.is_cancelled()
    }

    /// The congestion controller selection installed after authentication.
    pub fn congestion_selection(&self) -> Option<Selection> {
        self.tuning.selection()
    }

    /// Latches the first close error, signals done exactly once, and closes
    /// the QUIC connection with application error 0.
    pub fn close_with_error(&self, err: HysteriaError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_err.lock().unwrap() = Some(err);
        self.done.cancel();
        self.connection.close(0u32.into(), b"");
        self.endpoint.close(0u32.into(), b"");
    }

    pub fn close_error(&self) -> Option<String> {
        self.close_err.lock().unwrap().as_ref().map(|e| e.to_string())
    }

    async fn loop_messages(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                datagram = self.connection.read_datagram() => match datagram {
                    Ok(data) => {
                        if let Some(msg) = decode_datagram(data) {
                            if let Some(unknown) = self.sessions.route(msg) {
                                debug!("dropping datagram for unknown session {}", unknown.session_id);
                            }
                        }
                    }
                    Err(e) => {
                        self.close_with_error(from_connection_error(e));
                        break;
                    }
                },
            }
        }
        self.sessions.clear();
    }
}

enum WriteState {
    Initial,
    WritingRequest {
        frame: Bytes,
        written: usize,
        payload_len: usize,
    },
    Ready,
}

enum ReadState {
    AwaitingResponse { acc: BytesMut },
    Ready { leftover: BytesMut },
}

/// A proxied TCP byte stream.
///
/// The first write frames the TCP request carrying the destination and the
/// caller's payload as the initial chunk, and reports the payload length.
/// The first read consumes the TCP response frame; a server-signalled
/// failure surfaces as a `RemoteError`. The two state machines assume a
/// single logical reader and a single logical writer; concurrent
/// operations on the same direction are not supported.
pub struct ClientStreamConn<S = QuicStream> {
    stream: S,
    destination: NetLocation,
    write_state: WriteState,
    read_state: ReadState,
}

impl<S> ClientStreamConn<S> {
    pub(crate) fn new(stream: S, destination: NetLocation) -> Self {
        Self {
            stream,
            destination,
            write_state: WriteState::Initial,
            read_state: ReadState::AwaitingResponse {
                acc: BytesMut::new(),
            },
        }
    }

    pub fn destination(&self) -> &NetLocation {
        &self.destination
    }

    /// True until the first write sends the request frame.
    pub fn handshake_pending(&self) -> bool {
        matches!(self.write_state, WriteState::Initial)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ClientStreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Initial => {
                    // the payload rides inside the request frame; once
                    // captured, re-polls must pass the same buf
                    let frame =
                        protocol::write_tcp_request(&this.destination.to_string(), buf)
                            .map_err(std::io::Error::from)?;
                    this.write_state = WriteState::WritingRequest {
                        frame,
                        written: 0,
                        payload_len: buf.len(),
                    };
                }
                WriteState::WritingRequest {
                    frame,
                    written,
                    payload_len,
                } => {
                    while *written < frame.len() {
                        let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &frame[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let len = *payload_len;
                    this.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(len));
                }
                WriteState::Ready => return Pin::new(&mut this.stream).poll_write(cx, buf),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ClientStreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::Ready { leftover } => {
                    if !leftover.is_empty() {
                        let n = leftover.len().min(buf.remaining());
                        buf.put_slice(&leftover.split_to(n));
                        return Poll::Ready(Ok(()));
                    }
                    return Pin::new(&mut this.stream).poll_read(cx, buf);
                }
                ReadState::AwaitingResponse { acc } => {
                    match protocol::try_decode_tcp_response(acc).map_err(std::io::Error::from)? {
                        Some((true, _message)) => {
                            let leftover = std::mem::take(acc);
                            this.read_state = ReadState::Ready { leftover };
                        }
                        Some((false, message)) => {
                            return Poll::Ready(Err(HysteriaError::RemoteError(message).into()));
                        }
                        None => {
                            let mut chunk = [0u8; 4096];
                            let mut read_buf = ReadBuf::new(&mut chunk);
                            ready!(Pin::new(&mut this.stream).poll_read(cx, &mut read_buf))?;
                            if read_buf.filled().is_empty() {
                                return Poll::Ready(Err(HysteriaError::MalformedFrame(
                                    "stream ended before response frame",
                                )
                                .into()));
                            }
                            acc.extend_from_slice(read_buf.filled());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_conn(
        destination: &str,
    ) -> (ClientStreamConn<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let conn = ClientStreamConn::new(
            local,
            NetLocation::from_str(destination, None).unwrap(),
        );
        (conn, remote)
    }

    #[tokio::test]
    async fn test_first_write_frames_request_and_reports_payload_len() {
        let (mut conn, mut remote) = test_conn("example.com:80");
        assert!(conn.handshake_pending());

        let n = conn.write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(n, 18);
        assert!(!conn.handshake_pending());
        conn.write_all(b"more").await.unwrap();

        let destination = protocol::read_tcp_request(&mut remote).await.unwrap();
        assert_eq!(destination, "example.com:80");
        let mut payload = vec![0u8; 22];
        remote.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET / HTTP/1.0\r\n\r\nmore");
    }

    #[tokio::test]
    async fn test_first_read_consumes_response_frame() {
        let (mut conn, mut remote) = test_conn("example.com:80");
        let frame = protocol::write_tcp_response(true, "", b"HTTP/1.0 200 OK\r\n\r\nhi").unwrap();
        remote.write_all(&frame).await.unwrap();

        let mut read = vec![0u8; 21];
        conn.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"HTTP/1.0 200 OK\r\n\r\nhi");
    }

    #[tokio::test]
    async fn test_response_split_across_writes() {
        let (mut conn, mut remote) = test_conn("example.com:80");
        let frame = protocol::write_tcp_response(true, "", b"payload").unwrap();
        let (head, tail) = frame.split_at(3);
        remote.write_all(head).await.unwrap();
        remote.flush().await.unwrap();

        let mut read = vec![0u8; 7];
        let read_task = tokio::spawn(async move {
            conn.read_exact(&mut read).await.unwrap();
            read
        });
        tokio::task::yield_now().await;
        remote.write_all(tail).await.unwrap();
        assert_eq!(&read_task.await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_error_response_surfaces_remote_error() {
        let (mut conn, mut remote) = test_conn("example.com:80");
        let frame = protocol::write_tcp_response(false, "connection refused", b"").unwrap();
        remote.write_all(&frame).await.unwrap();

        let mut read = [0u8; 16];
        let err = conn.read(&mut read).await.unwrap_err();
        let inner = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<HysteriaError>())
            .unwrap();
        assert!(matches!(inner, HysteriaError::RemoteError(m) if m == "connection refused"));
    }

    #[tokio::test]
    async fn test_eof_before_response_is_malformed() {
        let (mut conn, remote) = test_conn("example.com:80");
        drop(remote);
        let mut read = [0u8; 4];
        let err = conn.read(&mut read).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
