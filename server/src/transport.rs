//! Datagram transport used by the server loop.

use crate::error::StartupError;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Best-effort, unordered datagram transport.
pub trait Transport {
    fn send_to(
        &self,
        buf: &[u8],
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Creates and binds the server socket as two separate steps so that each
/// failure is reported on its own. Must be called inside a tokio runtime.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, StartupError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(StartupError::Socket)?;

    socket
        .bind(&addr.into())
        .map_err(|source| StartupError::Bind { addr, source })?;
    socket.set_nonblocking(true).map_err(StartupError::Socket)?;

    let socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(socket).map_err(StartupError::Socket)
}
