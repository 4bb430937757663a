//! Open the listening (stream) or bound (datagram) socket of a service.
//!
//! All sockets are close-on-exec, handlers only ever see the descriptor that
//! gets duplicated onto their standard streams.

use log::trace;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};

use crate::entries::{ServiceSpec, Transport};

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};

/// Size of the queue of incoming, but yet to be accepted connections
pub const CONN_QUEUE_SIZE: i32 = 32;

#[derive(Debug)]
pub enum ServiceSocket {
    Stream(TcpListener),
    Datagram(UdpSocket),
}

impl ServiceSocket {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Self::Stream(listener) => listener.local_addr(),
            Self::Datagram(socket) => socket.local_addr(),
        }
    }
}

impl AsFd for ServiceSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Stream(listener) => listener.as_fd(),
            Self::Datagram(socket) => socket.as_fd(),
        }
    }
}

impl AsRawFd for ServiceSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

#[derive(Debug)]
pub enum BindError {
    AddressInUse(SocketAddr),
    PermissionDenied(SocketAddr),
    Resolution(String),
    /// select(2) can not watch descriptors at or above FD_SETSIZE
    DescriptorLimit(SocketAddr, RawFd),
    Io(SocketAddr, std::io::Error),
}

impl BindError {
    fn from_io(addr: SocketAddr, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddressInUse(addr),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr),
            std::io::ErrorKind::AddrNotAvailable => {
                Self::Resolution(format!("address {addr} is not available on this host"))
            }
            _ => Self::Io(addr, err),
        }
    }
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::AddressInUse(addr) => write!(f, "address {addr} is already in use"),
            Self::PermissionDenied(addr) => write!(f, "not permitted to bind {addr}"),
            Self::Resolution(reason) => write!(f, "can not resolve address: {reason}"),
            Self::DescriptorLimit(addr, fd) => write!(
                f,
                "socket for {addr} got fd {fd}, which is beyond the {} descriptors select can watch",
                libc::FD_SETSIZE
            ),
            Self::Io(addr, e) => write!(f, "could not open socket on {addr}: {e}"),
        }
    }
}

impl std::error::Error for BindError {}

fn check_selectable(addr: SocketAddr, fd: RawFd) -> Result<(), BindError> {
    if fd >= libc::FD_SETSIZE as RawFd {
        return Err(BindError::DescriptorLimit(addr, fd));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct SocketBinder {
    pub backlog: i32,
}

impl Default for SocketBinder {
    fn default() -> Self {
        Self {
            backlog: CONN_QUEUE_SIZE,
        }
    }
}

impl SocketBinder {
    #[must_use]
    pub const fn new(backlog: i32) -> Self {
        Self { backlog }
    }

    /// Create and bind the socket for a service. Stream sockets are put into
    /// listening, non-blocking mode. Datagram sockets stay blocking because the
    /// handler shares the open file description with the daemon.
    pub fn bind(&self, spec: &ServiceSpec) -> Result<ServiceSocket, BindError> {
        let addr = spec.listen;
        if addr.is_ipv6() != spec.protocol.is_ipv6() {
            return Err(BindError::Resolution(format!(
                "{addr} can not be used with {}",
                spec.protocol.name()
            )));
        }
        let domain = Domain::for_address(addr);
        let (ty, proto) = match spec.transport {
            Transport::Stream => (Type::STREAM, SockProtocol::TCP),
            Transport::Datagram => (Type::DGRAM, SockProtocol::UDP),
        };
        let socket =
            Socket::new(domain, ty, Some(proto)).map_err(|e| BindError::from_io(addr, e))?;
        check_selectable(addr, socket.as_raw_fd())?;
        if addr.is_ipv6() {
            socket
                .set_only_v6(true)
                .map_err(|e| BindError::from_io(addr, e))?;
        }
        socket
            .set_reuse_address(true)
            .map_err(|e| BindError::from_io(addr, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| BindError::from_io(addr, e))?;

        let socket = match spec.transport {
            Transport::Stream => {
                socket
                    .listen(self.backlog)
                    .map_err(|e| BindError::from_io(addr, e))?;
                socket
                    .set_nonblocking(true)
                    .map_err(|e| BindError::from_io(addr, e))?;
                ServiceSocket::Stream(TcpListener::from(socket))
            }
            Transport::Datagram => ServiceSocket::Datagram(UdpSocket::from(socket)),
        };
        trace!(
            "Opened socket for {} on {} (fd {})",
            spec.name,
            addr,
            socket.as_raw_fd()
        );
        Ok(socket)
    }
}
