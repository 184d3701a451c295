//! Hysteria2 server core.
//!
//! Each accepted QUIC connection starts in an HTTP/3 phase where every
//! request is either the protocol's auth request or is handed to the
//! masquerade handler, so unauthenticated traffic sees an ordinary web
//! server. The first successful auth ends the HTTP/3 phase permanently
//! and switches the session to proxy mode: new bidirectional streams
//! whose first varint is the TCP request frame type are hijacked, any
//! other stream (including a repeated auth request) is stopped, and QUIC
//! datagrams drive the UDP session table from the server side.
//!
//! Go service reference: https://github.com/apernet/hysteria/blob/master/core/server/server.go

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::ready;
use log::{debug, error};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::Runtime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::client::{
    DEFAULT_CONN_RECEIVE_WINDOW, DEFAULT_KEEP_ALIVE_PERIOD, DEFAULT_MAX_IDLE_TIMEOUT,
    DEFAULT_STREAM_RECEIVE_WINDOW,
};
use crate::congestion::{negotiate_server_tx, CongestionTuning, DynamicControllerFactory};
use crate::error::{from_connection_error, HysteriaError, Result};
use crate::protocol::{self, AuthResponse};
use crate::quic_stream::QuicStream;
use crate::salamander::SalamanderSocket;
use crate::udp::{decode_datagram, UdpPacketConn, UdpSessionTable};

type H3Connection = h3::server::Connection<h3_quinn::Connection, Bytes>;
type H3RequestStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Receives authenticated proxy connections from the service.
#[async_trait]
pub trait ServerHandler<U>: Send + Sync {
    /// A hijacked TCP stream. The implementation reaches the upstream
    /// destination and reports the outcome with `handshake_success` /
    /// `handshake_failure` on the conn (or implicitly, by writing payload).
    async fn new_connection(
        &self,
        user: U,
        conn: ServerStreamConn,
        source: SocketAddr,
        destination: NetLocation,
    );

    /// A UDP session created lazily by the first inbound datagram with an
    /// unknown session id.
    async fn new_packet_connection(&self, user: U, conn: UdpPacketConn, source: SocketAddr);
}

/// Serves every HTTP/3 request that is not a valid auth request.
#[async_trait]
pub trait MasqueradeHandler: Send + Sync {
    async fn serve(&self, request: http::Request<()>) -> http::Response<Bytes>;
}

/// The default masquerade: a bare 404 for everything.
pub struct NotFoundMasquerade;

#[async_trait]
impl MasqueradeHandler for NotFoundMasquerade {
    async fn serve(&self, _request: http::Request<()>) -> http::Response<Bytes> {
        http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .body(Bytes::new())
            .unwrap()
    }
}

/// Immutable service configuration; the user map is updated separately.
pub struct ServiceOptions<U> {
    pub context: CancellationToken,
    pub brutal_debug: bool,
    /// Upper bound on transmit rate per client in bits per second; 0 = no cap.
    pub send_bps: u64,
    /// Receive rate advertised to clients; 0 with `ignore_client_bandwidth`
    /// unset means no cap.
    pub receive_bps: u64,
    /// Always use BBR and tell clients to do the same.
    pub ignore_client_bandwidth: bool,
    /// Empty disables Salamander obfuscation.
    pub salamander_password: String,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub udp_disabled: bool,
    pub handler: Arc<dyn ServerHandler<U>>,
    pub masquerade: Arc<dyn MasqueradeHandler>,
    /// Initial congestion window hint; 0 keeps the default.
    pub initial_window: u64,
}

pub struct Service<U: Clone + Send + Sync + 'static> {
    options: ServiceOptions<U>,
    user_map: RwLock<Arc<HashMap<String, U>>>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl<U: Clone + Send + Sync + 'static> Service<U> {
    pub fn new(options: ServiceOptions<U>) -> Self {
        Self {
            options,
            user_map: RwLock::new(Arc::new(HashMap::new())),
            endpoint: Mutex::new(None),
        }
    }

    /// Replaces the user map wholesale. Sessions authenticated under the
    /// old map stay authenticated.
    pub fn update_users(&self, users: Vec<U>, passwords: Vec<String>) {
        let map: HashMap<String, U> = passwords.into_iter().zip(users).collect();
        *self.user_map.write().unwrap() = Arc::new(map);
    }

    /// Starts listening for QUIC connections on the given socket.
    pub fn start(self: &Arc<Self>, socket: std::net::UdpSocket) -> Result<()> {
        socket.set_nonblocking(true).map_err(HysteriaError::Io)?;
        let runtime = Arc::new(quinn::TokioRuntime);
        let mut wrapped: Arc<dyn quinn::AsyncUdpSocket> = runtime
            .wrap_udp_socket(socket)
            .map_err(HysteriaError::Io)?;
        if !self.options.salamander_password.is_empty() {
            wrapped = Arc::new(SalamanderSocket::new(
                wrapped,
                self.options.salamander_password.as_bytes(),
            ));
        }

        let tls_config = if self.options.tls_config.alpn_protocols.is_empty() {
            let mut config = (*self.options.tls_config).clone();
            config.alpn_protocols = vec![b"h3".to_vec()];
            Arc::new(config)
        } else {
            self.options.tls_config.clone()
        };
        let crypto: Arc<QuicServerConfig> = Arc::new(
            QuicServerConfig::try_from(tls_config)
                .map_err(|e| HysteriaError::TlsFailure(e.to_string()))?,
        );

        // a base config so the endpoint accepts; every connection gets its
        // own transport config with a fresh congestion tuning cell
        let base_config = quinn::ServerConfig::with_crypto(crypto.clone());
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(base_config),
            wrapped,
            runtime,
        )
        .map_err(HysteriaError::Io)?;

        *self.endpoint.lock().unwrap() = Some(endpoint.clone());
        tokio::spawn(self.clone().loop_connections(endpoint, crypto));
        Ok(())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }

    pub fn close(&self) {
        if let Some(endpoint) = self.endpoint.lock().unwrap().take() {
            endpoint.close(0u32.into(), b"");
        }
    }

    fn build_transport_config(&self, tuning: &Arc<CongestionTuning>) -> quinn::TransportConfig {
        let mut transport = quinn::TransportConfig::default();
        transport
            .max_concurrent_bidi_streams(quinn::VarInt::from_u64(1 << 60).unwrap())
            // HTTP/3 control and QPACK streams
            .max_concurrent_uni_streams(1024u32.into())
            .stream_receive_window(quinn::VarInt::from_u64(DEFAULT_STREAM_RECEIVE_WINDOW).unwrap())
            .receive_window(quinn::VarInt::from_u64(DEFAULT_CONN_RECEIVE_WINDOW).unwrap())
            .max_idle_timeout(Some(DEFAULT_MAX_IDLE_TIMEOUT.try_into().unwrap()))
            .keep_alive_interval(Some(DEFAULT_KEEP_ALIVE_PERIOD))
            .congestion_controller_factory(Arc::new(DynamicControllerFactory::new(
                tuning.clone(),
                self.options.initial_window,
                self.options.brutal_debug,
            )));
        if self.options.udp_disabled {
            transport.datagram_receive_buffer_size(None);
        }
        transport
    }

    async fn loop_connections(
        self: Arc<Self>,
        endpoint: quinn::Endpoint,
        crypto: Arc<QuicServerConfig>,
    ) {
        while let Some(incoming) = endpoint.accept().await {
            let tuning = CongestionTuning::new();
            let mut server_config = quinn::ServerConfig::with_crypto(crypto.clone());
            server_config.transport = Arc::new(self.build_transport_config(&tuning));

            let connecting = match incoming.accept_with(Arc::new(server_config)) {
                Ok(connecting) => connecting,
                Err(e) => {
                    debug!("failed to accept incoming connection: {}", e);
                    continue;
                }
            };

            let service = self.clone();
            tokio::spawn(async move {
                let connection = match connecting.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        debug!("connection handshake failed: {}", e);
                        return;
                    }
                };
                let session = Arc::new(ServerSession {
                    service,
                    source: connection.remote_address(),
                    connection,
                    tuning,
                    done: CancellationToken::new(),
                    close_guard: Mutex::new(()),
                    sessions: UdpSessionTable::new(),
                });
                match session.run().await {
                    Ok(()) => session.close_with_error(HysteriaError::ConnectionClosed),
                    Err(e) => session.close_with_error(e),
                }
            });
        }
    }
}

/// How one HTTP/3 request is dispatched.
enum AuthDecision<U> {
    Accept { user: U, request_rx: u64 },
    Masquerade,
}

fn evaluate_auth_request<U: Clone>(
    request: &http::Request<()>,
    user_map: &HashMap<String, U>,
) -> AuthDecision<U> {
    if request.method() != http::Method::POST
        || request.uri().host() != Some(protocol::AUTH_HOST)
        || request.uri().path() != protocol::AUTH_PATH
    {
        return AuthDecision::Masquerade;
    }
    let auth_request = protocol::auth_request_from_headers(request.headers());
    match user_map.get(&auth_request.auth) {
        Some(user) => AuthDecision::Accept {
            user: user.clone(),
            request_rx: auth_request.rx,
        },
        None => AuthDecision::Masquerade,
    }
}

/// One accepted QUIC connection: unauthenticated until the auth request
/// lands, a proxy session afterwards.
struct ServerSession<U: Clone + Send + Sync + 'static> {
    service: Arc<Service<U>>,
    connection: quinn::Connection,
    source: SocketAddr,
    tuning: Arc<CongestionTuning>,
    done: CancellationToken,
    close_guard: Mutex<()>,
    sessions: UdpSessionTable,
}

impl<U: Clone + Send + Sync + 'static> ServerSession<U> {
    async fn run(self: &Arc<Self>) -> Result<()> {
        // the h3 connection must be kept alive for the whole session: it
        // closes the underlying QUIC connection on drop
        let mut h3_conn: H3Connection =
            h3::server::Connection::new(h3_quinn::Connection::new(self.connection.clone()))
                .await
                .map_err(h3_error)?;

        let user = match self.auth_phase(&mut h3_conn).await? {
            Some(user) => user,
            // the peer went away without authenticating
            None => return Ok(()),
        };
        debug!("{} authenticated", self.source);

        self.spawn_done_propagator();
        if !self.service.options.udp_disabled {
            tokio::spawn(self.clone().loop_messages(user.clone()));
        }
        self.spawn_uni_drain();
        self.tcp_loop(user).await;
        drop(h3_conn);
        Ok(())
    }

    /// Serves HTTP/3 requests until the first successful authentication.
    /// Returning ends the HTTP/3 phase for good: from then on every new
    /// bidirectional stream goes through the first-frame peek in
    /// `tcp_loop`, and a repeated auth request is refused like any other
    /// non-proxy stream.
    async fn auth_phase(&self, h3_conn: &mut H3Connection) -> Result<Option<U>> {
        loop {
            match h3_conn.accept().await {
                Ok(Some((request, stream))) => {
                    let user_map = self.service.user_map.read().unwrap().clone();
                    match evaluate_auth_request(&request, &user_map) {
                        AuthDecision::Accept { user, request_rx } => {
                            self.install_congestion_controller(request_rx);
                            self.send_auth_ok(stream).await?;
                            return Ok(Some(user));
                        }
                        AuthDecision::Masquerade => {
                            self.serve_masquerade(request, stream).await?;
                        }
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(h3_error(e)),
            }
        }
    }

    fn install_congestion_controller(&self, request_rx: u64) {
        let selection = negotiate_server_tx(
            request_rx,
            self.service.options.send_bps,
            self.service.options.ignore_client_bandwidth,
        );
        self.tuning.install(selection);
        debug!("{} congestion controller: {:?}", self.source, selection);
    }

    async fn send_auth_ok(&self, mut stream: H3RequestStream) -> Result<()> {
        let mut response = http::Response::builder()
            .status(http::StatusCode::from_u16(protocol::STATUS_AUTH_OK).unwrap())
            .body(())
            .unwrap();
        protocol::auth_response_to_headers(
            response.headers_mut(),
            &AuthResponse {
                udp_enabled: !self.service.options.udp_disabled,
                rx: self.service.options.receive_bps,
                rx_auto: self.service.options.ignore_client_bandwidth,
            },
        );
        stream.send_response(response).await.map_err(h3_error)?;
        stream.finish().await.map_err(h3_error)?;
        Ok(())
    }

    async fn serve_masquerade(
        &self,
        request: http::Request<()>,
        mut stream: H3RequestStream,
    ) -> Result<()> {
        let response = self.service.options.masquerade.serve(request).await;
        let (parts, body) = response.into_parts();
        stream
            .send_response(http::Response::from_parts(parts, ()))
            .await
            .map_err(h3_error)?;
        if !body.is_empty() {
            stream.send_data(body).await.map_err(h3_error)?;
        }
        stream.finish().await.map_err(h3_error)?;
        Ok(())
    }

    fn spawn_done_propagator(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.service.options.context.cancelled() => {
                    session.close_with_error(HysteriaError::Cancelled);
                }
                _ = session.done.cancelled() => {}
            }
        });
    }

    /// Some clients keep opening unidirectional streams after auth; accept
    /// and discard them so they do not pile up.
    fn spawn_uni_drain(self: &Arc<Self>) {
        let connection = self.connection.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    uni = connection.accept_uni() => match uni {
                        Ok(mut recv) => {
                            let _ = recv.stop(0u32.into());
                        }
                        Err(_) => break,
                    },
                }
            }
        });
    }

    async fn tcp_loop(self: &Arc<Self>, user: U) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                stream = self.connection.accept_bi() => match stream {
                    Ok((send, recv)) => {
                        let session = self.clone();
                        let user = user.clone();
                        tokio::spawn(async move {
                            session.handle_stream(user, send, recv).await;
                        });
                    }
                    Err(e) => {
                        self.close_with_error(from_connection_error(e));
                        break;
                    }
                },
            }
        }
    }

    /// The stream hijacker: peeks the first varint of a new bidirectional
    /// stream and takes ownership when it is a TCP request. Anything else
    /// is refused, since HTTP/3 request handling ended with the auth phase.
    async fn handle_stream(
        self: Arc<Self>,
        user: U,
        send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) {
        let frame_type = match protocol::read_varint(&mut recv).await {
            Ok(frame_type) => frame_type,
            Err(e) => {
                debug!("failed to read stream frame type: {}", e);
                return;
            }
        };
        if frame_type != protocol::FRAME_TYPE_TCP_REQUEST {
            debug!("refusing stream with frame type {:#x}", frame_type);
            let _ = recv.stop(0u32.into());
            return;
        }

        let destination = match protocol::read_tcp_request_fields(&mut recv).await {
            Ok(destination) => destination,
            Err(e) => {
                // a malformed frame aborts just this stream
                error!("failed to read TCP request: {}", e);
                let _ = recv.stop(0u32.into());
                return;
            }
        };
        let destination = match NetLocation::from_str(&destination, None) {
            Ok(destination) => destination,
            Err(e) => {
                error!("invalid TCP request destination: {}", e);
                let _ = recv.stop(0u32.into());
                return;
            }
        };

        let conn = ServerStreamConn::new(QuicStream::from(send, recv));
        self.service
            .options
            .handler
            .new_connection(user, conn, self.source, destination)
            .await;
    }

    async fn loop_messages(self: Arc<Self>, user: U) {
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                datagram = self.connection.read_datagram() => match datagram {
                    Ok(data) => self.handle_datagram(&user, data),
                    Err(e) => {
                        self.close_with_error(from_connection_error(e));
                        break;
                    }
                },
            }
        }
        self.sessions.clear();
    }

    fn handle_datagram(self: &Arc<Self>, user: &U, data: Bytes) {
        let Some(msg) = decode_datagram(data) else {
            return;
        };
        if let Some(msg) = self.sessions.route(msg) {
            // first datagram of a new session: create it and hand the
            // packet conn to the handler
            let conn = self
                .sessions
                .insert_session(msg.session_id, self.connection.clone());
            debug!("{} new UDP session {}", self.source, msg.session_id);
            if self.sessions.route(msg).is_some() {
                debug!("UDP session vanished before first packet");
            }
            let handler = self.service.options.handler.clone();
            let user = user.clone();
            let source = self.source;
            tokio::spawn(async move {
                handler.new_packet_connection(user, conn, source).await;
            });
        }
    }

    /// Single-entry close; logs at debug level for orderly teardown and at
    /// error level otherwise.
    fn close_with_error(&self, err: HysteriaError) {
        {
            let _guard = self.close_guard.lock().unwrap();
            if self.done.is_cancelled() {
                return;
            }
            self.done.cancel();
        }
        if err.is_closed_or_canceled() {
            debug!("{} connection closed: {}", self.source, err);
        } else {
            error!("{} connection failed: {}", self.source, err);
        }
        self.connection.close(0u32.into(), b"");
    }
}

fn h3_error(err: h3::Error) -> HysteriaError {
    HysteriaError::Io(std::io::Error::other(err))
}

enum ResponseState {
    Pending,
    Writing {
        frame: Bytes,
        written: usize,
        payload_len: usize,
    },
    Written,
}

/// The server side of a proxied TCP stream.
///
/// The response frame is written exactly once: by `handshake_success`,
/// by `handshake_failure`, or implicitly by the first payload write, which
/// sends the success frame with the payload as the initial chunk.
pub struct ServerStreamConn<S = QuicStream> {
    stream: S,
    response_state: ResponseState,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ServerStreamConn<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            response_state: ResponseState::Pending,
        }
    }

    /// Acknowledges the TCP request. Idempotent: once a success response is
    /// on the wire (explicitly or via a payload write), this is a no-op.
    pub async fn handshake_success(&mut self) -> Result<()> {
        if !matches!(self.response_state, ResponseState::Pending) {
            return Ok(());
        }
        let frame = protocol::write_tcp_response(true, "", b"")?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(HysteriaError::Io)?;
        self.response_state = ResponseState::Written;
        Ok(())
    }

    /// Rejects the TCP request with a message. Fails once any response has
    /// already been written.
    pub async fn handshake_failure(&mut self, message: &str) -> Result<()> {
        if !matches!(self.response_state, ResponseState::Pending) {
            return Err(HysteriaError::HandshakeAlreadyWritten);
        }
        let frame = protocol::write_tcp_response(false, message, b"")?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(HysteriaError::Io)?;
        self.response_state = ResponseState::Written;
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerStreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ServerStreamConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.response_state {
                ResponseState::Pending => {
                    // first payload write doubles as the success signal
                    let frame =
                        protocol::write_tcp_response(true, "", buf).map_err(std::io::Error::from)?;
                    this.response_state = ResponseState::Writing {
                        frame,
                        written: 0,
                        payload_len: buf.len(),
                    };
                }
                ResponseState::Writing {
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
                    this.response_state = ResponseState::Written;
                    return Poll::Ready(Ok(len));
                }
                ResponseState::Written => return Pin::new(&mut this.stream).poll_write(cx, buf),
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
