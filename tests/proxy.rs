//! End-to-end proxy scenarios over loopback QUIC with self-signed TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hysteria2_core::congestion::Selection;
use hysteria2_core::{
    Client, ClientOptions, DirectDialer, HysteriaError, MasqueradeHandler, NativeResolver,
    NetLocation, NotFoundMasquerade, ServerHandler, ServerStreamConn, Service, ServiceOptions,
    UdpPacketConn,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts any server certificate; the tests pin trust to the loopback.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::aws_lc_rs::default_provider())))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// quinn and this crate together enable more than one rustls crypto
/// backend, so the builders need the process default pinned explicitly.
fn install_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

fn server_tls_config() -> Arc<rustls::ServerConfig> {
    install_crypto_provider();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .unwrap(),
    )
}

fn client_tls_config() -> Arc<rustls::ClientConfig> {
    install_crypto_provider();
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth(),
    )
}

/// Handles proxied connections in-process: TCP requests to
/// `refused.example.com` are rejected, anything else gets a canned HTTP
/// response after the request bytes arrive; UDP packets are recorded and
/// echoed back.
struct TestHandler {
    udp_packets: mpsc::UnboundedSender<(Vec<u8>, String)>,
}

impl TestHandler {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Vec<u8>, String)>) {
        let (udp_packets, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { udp_packets }), receiver)
    }
}

#[async_trait]
impl ServerHandler<String> for TestHandler {
    async fn new_connection(
        &self,
        user: String,
        mut conn: ServerStreamConn,
        _source: SocketAddr,
        destination: NetLocation,
    ) {
        assert_eq!(user, "alice");
        if destination.to_string() == "refused.example.com:1" {
            conn.handshake_failure("connection refused").await.unwrap();
            return;
        }
        assert_eq!(destination.to_string(), "example.com:80");
        conn.handshake_success().await.unwrap();

        let mut request = vec![0u8; 18];
        conn.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");
        conn.write_all(b"HTTP/1.0 200 OK\r\n\r\nhi").await.unwrap();
        conn.flush().await.unwrap();
    }

    async fn new_packet_connection(
        &self,
        user: String,
        conn: UdpPacketConn,
        _source: SocketAddr,
    ) {
        assert_eq!(user, "alice");
        while let Ok((payload, address)) = conn.recv_from().await {
            self.udp_packets
                .send((payload.to_vec(), address.to_string()))
                .unwrap();
            if conn.send_to(&payload, &address).await.is_err() {
                break;
            }
        }
    }
}

struct ServerParams {
    send_bps: u64,
    receive_bps: u64,
    ignore_client_bandwidth: bool,
    udp_disabled: bool,
    salamander_password: String,
    users: Vec<(String, String)>,
    masquerade: Arc<dyn MasqueradeHandler>,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            send_bps: 80_000_000,
            receive_bps: 50_000_000,
            ignore_client_bandwidth: false,
            udp_disabled: false,
            salamander_password: String::new(),
            users: vec![("alice".to_string(), "p".to_string())],
            masquerade: Arc::new(NotFoundMasquerade),
        }
    }
}

fn start_server(
    params: ServerParams,
) -> (
    Arc<Service<String>>,
    SocketAddr,
    mpsc::UnboundedReceiver<(Vec<u8>, String)>,
) {
    let (handler, udp_packets) = TestHandler::new();
    let service = Arc::new(Service::new(ServiceOptions {
        context: CancellationToken::new(),
        brutal_debug: false,
        send_bps: params.send_bps,
        receive_bps: params.receive_bps,
        ignore_client_bandwidth: params.ignore_client_bandwidth,
        salamander_password: params.salamander_password,
        tls_config: server_tls_config(),
        udp_disabled: params.udp_disabled,
        handler,
        masquerade: params.masquerade,
        initial_window: 0,
    }));
    let (users, passwords) = params.users.into_iter().unzip();
    service.update_users(users, passwords);

    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    service.start(socket).unwrap();
    (service, addr, udp_packets)
}

struct ClientParams {
    password: String,
    send_bps: u64,
    receive_bps: u64,
    udp_disabled: bool,
    salamander_password: String,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            password: "p".to_string(),
            send_bps: 100_000_000,
            receive_bps: 50_000_000,
            udp_disabled: false,
            salamander_password: String::new(),
        }
    }
}

fn make_client(server: SocketAddr, params: ClientParams) -> Client {
    Client::new(ClientOptions {
        context: CancellationToken::new(),
        dialer: Arc::new(DirectDialer::default()),
        resolver: Arc::new(NativeResolver::new()),
        server_address: NetLocation::from_socket_addr(server),
        sni_hostname: Some("localhost".to_string()),
        brutal_debug: false,
        send_bps: params.send_bps,
        receive_bps: params.receive_bps,
        salamander_password: params.salamander_password,
        password: params.password,
        tls_config: client_tls_config(),
        udp_disabled: params.udp_disabled,
        initial_window: 0,
    })
}

async fn tcp_round_trip(client: &Client) {
    let mut conn = timeout(
        TEST_TIMEOUT,
        client.dial_conn(NetLocation::from_str("example.com:80", None).unwrap()),
    )
    .await
    .unwrap()
    .unwrap();

    conn.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = vec![0u8; 21];
    timeout(TEST_TIMEOUT, conn.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response, b"HTTP/1.0 200 OK\r\n\r\nhi");
}

#[tokio::test]
async fn test_auth_success_brutal_rate() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let conn = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    // the server echoes its 50 Mbps receive rate; the client takes the
    // minimum against its own 100 Mbps cap
    assert_eq!(
        conn.congestion_selection(),
        Some(Selection::Brutal(50_000_000))
    );

    // both sides have UDP enabled
    let packet_conn = client.listen_packet().await.unwrap();
    packet_conn.close();
}

#[tokio::test]
async fn test_auth_success_auto_mode() {
    let (_service, addr, _udp) = start_server(ServerParams {
        ignore_client_bandwidth: true,
        ..Default::default()
    });
    let client = make_client(addr, ClientParams::default());

    let conn = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    assert_eq!(conn.congestion_selection(), Some(Selection::Bbr));
}

#[tokio::test]
async fn test_auth_failure_is_masqueraded_404() {
    let (_service, addr, _udp) = start_server(ServerParams {
        users: vec![("alice".to_string(), "q".to_string())],
        ..Default::default()
    });
    let client = make_client(addr, ClientParams::default());

    let err = timeout(TEST_TIMEOUT, client.offer())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        HysteriaError::AuthenticationFailed { status: 404 }
    ));
}

#[tokio::test]
async fn test_tcp_proxy_round_trip() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());
    tcp_round_trip(&client).await;
}

#[tokio::test]
async fn test_tcp_proxy_remote_error() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let mut conn = timeout(
        TEST_TIMEOUT,
        client.dial_conn(NetLocation::from_str("refused.example.com:1", None).unwrap()),
    )
    .await
    .unwrap()
    .unwrap();

    conn.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 8];
    let err = timeout(TEST_TIMEOUT, conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    let inner = err
        .get_ref()
        .and_then(|e| e.downcast_ref::<HysteriaError>())
        .unwrap();
    assert!(matches!(
        inner,
        HysteriaError::RemoteError(message) if message == "connection refused"
    ));
}

#[tokio::test]
async fn test_udp_fragmentation_round_trip() {
    let (_service, addr, mut udp_packets) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let packet_conn = timeout(TEST_TIMEOUT, client.listen_packet())
        .await
        .unwrap()
        .unwrap();

    // well above the QUIC datagram size, so this must fragment
    let payload: Vec<u8> = (0..4000).map(|i| i as u8).collect();
    let destination = NetLocation::from_str("8.8.8.8:53", None).unwrap();
    packet_conn.send_to(&payload, &destination).await.unwrap();

    let (received, address) = timeout(TEST_TIMEOUT, udp_packets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);
    assert_eq!(address, "8.8.8.8:53");

    // and the echo comes back reassembled as well
    let (echoed, from) = timeout(TEST_TIMEOUT, packet_conn.recv_from())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], &payload[..]);
    assert_eq!(from.to_string(), "8.8.8.8:53");
}

#[tokio::test]
async fn test_udp_disabled_by_server() {
    let (_service, addr, _udp) = start_server(ServerParams {
        udp_disabled: true,
        ..Default::default()
    });
    let client = make_client(addr, ClientParams::default());

    let err = timeout(TEST_TIMEOUT, client.listen_packet())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HysteriaError::UdpDisabledByServer));
}

#[tokio::test]
async fn test_udp_disabled_locally() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(
        addr,
        ClientParams {
            udp_disabled: true,
            ..Default::default()
        },
    );

    let err = timeout(TEST_TIMEOUT, client.listen_packet())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HysteriaError::Invalid));
}

#[tokio::test]
async fn test_salamander_round_trip() {
    let (_service, addr, _udp) = start_server(ServerParams {
        salamander_password: "obfs".to_string(),
        ..Default::default()
    });
    let client = make_client(
        addr,
        ClientParams {
            salamander_password: "obfs".to_string(),
            ..Default::default()
        },
    );
    tcp_round_trip(&client).await;
}

#[tokio::test]
async fn test_session_ids_are_distinct() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let a = client.listen_packet().await.unwrap();
    let b = client.listen_packet().await.unwrap();
    assert_ne!(a.session_id(), b.session_id());
}

#[tokio::test]
async fn test_connection_is_reused_across_dials() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let first = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    tcp_round_trip(&client).await;
    let second = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_client_redials_after_close() {
    let (_service, addr, _udp) = start_server(ServerParams::default());
    let client = make_client(addr, ClientParams::default());

    let first = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    first.close_with_error(HysteriaError::ConnectionClosed);
    assert!(!first.active());

    let second = timeout(TEST_TIMEOUT, client.offer()).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.active());
    tcp_round_trip(&client).await;
}

struct TeapotMasquerade;

#[async_trait]
impl MasqueradeHandler for TeapotMasquerade {
    async fn serve(&self, request: http::Request<()>) -> http::Response<Bytes> {
        assert_eq!(request.uri().path(), hysteria2_core::protocol::AUTH_PATH);
        http::Response::builder()
            .status(http::StatusCode::IM_A_TEAPOT)
            .body(Bytes::from_static(b"short and stout"))
            .unwrap()
    }
}

#[tokio::test]
async fn test_custom_masquerade_status_is_surfaced() {
    let (_service, addr, _udp) = start_server(ServerParams {
        users: vec![("alice".to_string(), "other".to_string())],
        masquerade: Arc::new(TeapotMasquerade),
        ..Default::default()
    });
    let client = make_client(addr, ClientParams::default());

    let err = timeout(TEST_TIMEOUT, client.offer())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        HysteriaError::AuthenticationFailed { status: 418 }
    ));
}
