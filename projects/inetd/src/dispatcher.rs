//! Turn readiness of one entry's socket into a running handler.
//!
//! Stream entries accept exactly one connection per readiness and hand the
//! connected socket to the handler; the daemon closes its copy right after the
//! fork. Datagram entries hand over the bound socket itself. Wait entries are
//! parked until their handler exits, datagram nowait entries only until the
//! settle interval passed.

use log::trace;

use crate::entries::{Concurrency, Transport};
use crate::registry::{EntryId, ServiceEntry};
use crate::services::{SpawnError, SpawnRecord, Spawner};
use crate::sockets::ServiceSocket;

use std::os::unix::io::AsFd;
use std::time::{Duration, Instant};

/// How long a datagram nowait entry stays out of the watch set after spawning
pub const DEFAULT_DATAGRAM_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum DispatchError {
    Accept(std::io::Error),
    Spawn(SpawnError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Accept(e) => write!(f, "accept failed: {e}"),
            Self::Spawn(e) => write!(f, "could not start handler: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Clone, Copy, Debug)]
pub struct Dispatcher {
    pub datagram_settle: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            datagram_settle: DEFAULT_DATAGRAM_SETTLE,
        }
    }
}

impl Dispatcher {
    #[must_use]
    pub const fn new(datagram_settle: Duration) -> Self {
        Self { datagram_settle }
    }

    /// Handle readiness of `entry`. `Ok(None)` means there was nothing to do,
    /// e.g. a connection vanished between select and accept.
    pub fn dispatch<S: Spawner>(
        &self,
        id: EntryId,
        entry: &mut ServiceEntry,
        spawner: &mut S,
        now: Instant,
    ) -> Result<Option<SpawnRecord>, DispatchError> {
        if !entry.is_watchable() {
            trace!("Ignoring readiness of parked entry {}", entry.spec.name);
            return Ok(None);
        }

        let pid = match &entry.socket {
            ServiceSocket::Stream(listener) => {
                let (conn, peer) = match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                        ) =>
                    {
                        return Ok(None)
                    }
                    Err(e) => return Err(DispatchError::Accept(e)),
                };
                trace!("Connection from {peer} for {}", entry.spec.name);
                // some platforms let the connection inherit O_NONBLOCK from the listener
                conn.set_nonblocking(false).map_err(DispatchError::Accept)?;
                spawner
                    .spawn(&entry.spec, conn.as_fd())
                    .map_err(DispatchError::Spawn)?
                // conn is dropped here, the handler holds the only other copy
            }
            ServiceSocket::Datagram(socket) => spawner
                .spawn(&entry.spec, socket.as_fd())
                .map_err(DispatchError::Spawn)?,
        };

        match (entry.spec.concurrency, entry.spec.transport) {
            (Concurrency::Wait, _) => entry.park(pid, None),
            (Concurrency::Nowait, Transport::Datagram) => {
                entry.park(pid, Some(now + self.datagram_settle));
            }
            (Concurrency::Nowait, Transport::Stream) => {}
        }

        Ok(Some(SpawnRecord {
            pid,
            entry: id,
            started: now,
        }))
    }
}
