/// Creates a nonblocking UDP socket suitable for handing to the QUIC
/// endpoint. Binds to the wildcard address of the family matching the
/// remote.
pub fn new_udp_socket(
    remote_is_ipv6: bool,
    bind_interface: Option<&str>,
) -> std::io::Result<std::net::UdpSocket> {
    let bind_address = if remote_is_ipv6 { "[::]:0" } else { "0.0.0.0:0" };
    let socket = std::net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    if let Some(_interface) = bind_interface {
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            let tokio_socket = tokio::net::UdpSocket::from_std(socket)?;
            tokio_socket.bind_device(Some(_interface.as_bytes()))?;
            return tokio_socket.into_std();
        }

        // This should be rejected during option validation.
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "cannot bind to device, unsupported platform",
        ));
    }

    Ok(socket)
}
