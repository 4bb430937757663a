use nix::unistd::Pid;

use crate::registry::EntryId;
use crate::signal_handler::ChildTermination;

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A running handler and the entry that started it
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SpawnRecord {
    pub pid: Pid,
    pub entry: EntryId,
    pub started: Instant,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Reaped {
    pub record: SpawnRecord,
    pub termination: ChildTermination,
    pub runtime: Duration,
}

/// Maps handler pids back to their entries.
///
/// The pids handed to `collect` were already reaped by the signal thread, this
/// only does the bookkeeping for the control loop.
#[derive(Debug, Default)]
pub struct Reaper {
    records: HashMap<Pid, SpawnRecord>,
}

impl Reaper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, record: SpawnRecord) {
        self.records.insert(record.pid, record);
    }

    /// Forget `pid`. Returns None for pids this daemon did not spawn.
    pub fn collect(
        &mut self,
        pid: Pid,
        termination: ChildTermination,
        now: Instant,
    ) -> Option<Reaped> {
        let record = self.records.remove(&pid)?;
        Some(Reaped {
            record,
            termination,
            runtime: now.saturating_duration_since(record.started),
        })
    }

    #[cfg(test)]
    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.records.contains_key(&pid)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records.len()
    }
}
