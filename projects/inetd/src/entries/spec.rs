//! The fully resolved description of one inetd.conf line.
//!
//! A `ServiceSpec` is immutable once built. The registry compares specs
//! byte-for-byte on reload and the binder only ever reads them, so every
//! lookup against system databases (ports, users, groups) has already
//! happened by the time one of these exists.

use nix::unistd::{Gid, Uid};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub enum Transport {
    Stream,
    Datagram,
}

impl Transport {
    #[must_use]
    pub fn from_conf(word: &str) -> Option<Self> {
        match word {
            "stream" => Some(Self::Stream),
            "dgram" => Some(Self::Datagram),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Datagram => "dgram",
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub enum Protocol {
    Tcp,
    Udp,
    Tcp6,
    Udp6,
}

impl Protocol {
    #[must_use]
    pub fn from_conf(word: &str) -> Option<Self> {
        match word {
            "tcp" | "tcp4" => Some(Self::Tcp),
            "udp" | "udp4" => Some(Self::Udp),
            "tcp6" => Some(Self::Tcp6),
            "udp6" => Some(Self::Udp6),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Tcp6 => "tcp6",
            Self::Udp6 => "udp6",
        }
    }

    /// Name used in the services database, which does not distinguish families
    #[must_use]
    pub const fn db_name(self) -> &'static str {
        match self {
            Self::Tcp | Self::Tcp6 => "tcp",
            Self::Udp | Self::Udp6 => "udp",
        }
    }

    #[must_use]
    pub const fn is_ipv6(self) -> bool {
        matches!(self, Self::Tcp6 | Self::Udp6)
    }

    /// The only transport this protocol can carry
    #[must_use]
    pub const fn transport(self) -> Transport {
        match self {
            Self::Tcp | Self::Tcp6 => Transport::Stream,
            Self::Udp | Self::Udp6 => Transport::Datagram,
        }
    }

    #[must_use]
    pub const fn wildcard(self) -> IpAddr {
        if self.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Concurrency {
    /// One handler at a time, the socket is parked while it runs
    Wait,
    /// A fresh handler for every unit of work
    Nowait,
}

impl Concurrency {
    #[must_use]
    pub fn from_conf(word: &str) -> Option<Self> {
        match word {
            "wait" => Some(Self::Wait),
            "nowait" => Some(Self::Nowait),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Nowait => "nowait",
        }
    }
}

/// The identity a handler runs with
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RunAs {
    pub name: String,
    /// Group as written in the config, if it overrides the user's primary group
    pub group: Option<String>,
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

/// Identity of a service across reloads
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub struct ServiceKey {
    pub name: String,
    pub transport: Transport,
    pub protocol: Protocol,
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.name,
            self.transport.name(),
            self.protocol.name()
        )
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ServiceSpec {
    /// The service field as written, including an optional `host:` prefix
    pub name: String,
    pub transport: Transport,
    pub protocol: Protocol,
    pub concurrency: Concurrency,
    pub user: RunAs,
    pub program: PathBuf,
    /// argv for the handler. argv[0] is conventionally the program name.
    pub args: Vec<String>,
    /// Resolved address the socket binds to
    pub listen: SocketAddr,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum SpecError {
    EmptyArguments,
    TransportMismatch(Transport, Protocol),
    FamilyMismatch(SocketAddr, Protocol),
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::EmptyArguments => f.write_str("argument vector needs at least one element"),
            Self::TransportMismatch(transport, protocol) => write!(
                f,
                "transport {} can not be used with protocol {}",
                transport.name(),
                protocol.name()
            ),
            Self::FamilyMismatch(addr, protocol) => write!(
                f,
                "address {} does not belong to the family of protocol {}",
                addr,
                protocol.name()
            ),
        }
    }
}

impl std::error::Error for SpecError {}

impl ServiceSpec {
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            transport: self.transport,
            protocol: self.protocol,
        }
    }

    #[must_use]
    pub fn is_wait(&self) -> bool {
        self.concurrency == Concurrency::Wait
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.args.is_empty() {
            return Err(SpecError::EmptyArguments);
        }
        if self.protocol.transport() != self.transport {
            return Err(SpecError::TransportMismatch(self.transport, self.protocol));
        }
        if self.listen.is_ipv6() != self.protocol.is_ipv6() {
            return Err(SpecError::FamilyMismatch(self.listen, self.protocol));
        }
        Ok(())
    }
}

impl std::fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&super::render::render_spec(self))
    }
}
