//! The set of live service entries.
//!
//! Entries live in a generational arena. An `EntryId` stays valid until its
//! entry is removed; afterwards lookups with it fail even if the slot got
//! reused, so stale ids held by the reaper or the multiplexer are harmless.

use crate::entries::{ServiceKey, ServiceSpec, Transport};
use crate::sockets::ServiceSocket;
use crate::throttle::Health;

use nix::unistd::Pid;

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// The handler an entry is parked on
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Busy {
    pub pid: Pid,
    /// Set for datagram nowait entries, which go back to the watch set at
    /// this point even if the handler keeps running
    pub release_at: Option<Instant>,
}

#[derive(Debug)]
pub struct ServiceEntry {
    pub spec: ServiceSpec,
    pub socket: ServiceSocket,
    pub busy: Option<Busy>,
    pub health: Health,
}

impl ServiceEntry {
    #[must_use]
    pub fn new(spec: ServiceSpec, socket: ServiceSocket) -> Self {
        Self {
            spec,
            socket,
            busy: None,
            health: Health::default(),
        }
    }

    /// Whether the socket belongs in the multiplexer's watch set
    #[must_use]
    pub const fn is_watchable(&self) -> bool {
        self.busy.is_none() && !self.health.is_disabled()
    }

    pub fn park(&mut self, pid: Pid, release_at: Option<Instant>) {
        self.busy = Some(Busy { pid, release_at });
    }

    /// Clear the busy flag if `pid` is the handler it is parked on
    pub fn release(&mut self, pid: Pid) -> bool {
        match self.busy {
            Some(busy) if busy.pid == pid => {
                self.busy = None;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let settle = self.busy.and_then(|busy| busy.release_at);
        match (settle, self.health.disabled_until()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    #[must_use]
    pub fn state(&self) -> EntryState {
        if let Some(until) = self.health.disabled_until() {
            EntryState::Disabled(until)
        } else if let Some(busy) = self.busy {
            EntryState::Busy(busy.pid)
        } else {
            EntryState::Listening
        }
    }

    #[must_use]
    pub fn status(&self) -> EntryStatus {
        EntryStatus {
            rendering: self.spec.to_string(),
            local_addr: self.socket.local_addr().ok(),
            fd: self.socket.as_raw_fd(),
            state: self.state(),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum EntryState {
    Listening,
    Busy(Pid),
    Disabled(Instant),
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Listening => f.write_str("listening"),
            Self::Busy(pid) => write!(f, "busy (pid {pid})"),
            Self::Disabled(until) => write!(
                f,
                "disabled for another {}s",
                until.saturating_duration_since(Instant::now()).as_secs()
            ),
        }
    }
}

/// Snapshot of one entry for status dumps
#[derive(Clone, Debug)]
pub struct EntryStatus {
    pub rendering: String,
    pub local_addr: Option<SocketAddr>,
    pub fd: RawFd,
    pub state: EntryState,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.local_addr {
            Some(addr) => write!(f, "{} on {} (fd {}): {}", self.rendering, addr, self.fd, self.state),
            None => write!(f, "{} (fd {}): {}", self.rendering, self.fd, self.state),
        }
    }
}

/// What `ServiceRegistry::readmit_elapsed` put back into the watch set
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Readmission {
    /// The backoff of a disabled entry ran out
    Enabled(EntryId),
    /// A datagram nowait entry waited long enough for its handler to read
    Settled(EntryId),
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<ServiceEntry>,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: ServiceEntry) -> EntryId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            EntryId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            EntryId {
                index,
                generation: 0,
            }
        }
    }

    /// Take an entry out. Dropping the returned entry closes its socket.
    pub fn remove(&mut self, id: EntryId) -> Option<ServiceEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(entry)
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&ServiceEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation == id.generation {
            slot.entry.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut ServiceEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation == id.generation {
            slot.entry.as_mut()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &ServiceEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    #[must_use]
    pub fn find(&self, key: &ServiceKey) -> Option<EntryId> {
        self.iter()
            .find(|(_, entry)| {
                entry.spec.name == key.name
                    && entry.spec.transport == key.transport
                    && entry.spec.protocol == key.protocol
            })
            .map(|(id, _)| id)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Earliest point at which an entry has to be reconsidered without any event
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.iter()
            .filter_map(|(_, entry)| entry.next_deadline())
            .min()
    }

    /// Lift disables whose backoff ran out and unpark datagram nowait entries
    /// whose settle interval passed
    pub fn readmit_elapsed(&mut self, now: Instant) -> Vec<Readmission> {
        let mut readmitted = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            let id = EntryId {
                index: index as u32,
                generation: slot.generation,
            };
            if entry.health.readmit_if_elapsed(now) {
                readmitted.push(Readmission::Enabled(id));
            }
            if let Some(Busy {
                release_at: Some(release_at),
                ..
            }) = entry.busy
            {
                if release_at <= now && entry.spec.transport == Transport::Datagram {
                    entry.busy = None;
                    readmitted.push(Readmission::Settled(id));
                }
            }
        }
        readmitted
    }

    /// Remove every entry, closing all sockets once the result is dropped
    pub fn drain(&mut self) -> Vec<ServiceEntry> {
        let mut entries = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                entries.push(entry);
            }
        }
        self.len = 0;
        entries
    }

    #[must_use]
    pub fn status(&self) -> Vec<EntryStatus> {
        self.iter().map(|(_, entry)| entry.status()).collect()
    }
}
