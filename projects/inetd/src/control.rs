//! Everything that reaches the control loop from outside of it.
//!
//! Signal deliveries and requests from other threads are turned into
//! `ControlEvent`s and queued on a channel. Every send is followed by one byte
//! on a socketpair whose read end sits in the multiplexer's watch set, so a
//! blocked `select` returns and the loop drains the queue.

use crate::registry::EntryStatus;
use crate::signal_handler::ChildTermination;

use log::trace;
use nix::unistd::Pid;

use std::io::{Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub enum ControlEvent {
    Reload,
    Shutdown,
    /// Log the state of every entry
    StatusDump,
    /// Send the state of every entry back over the enclosed channel
    Status(Sender<Vec<EntryStatus>>),
    ChildExited {
        pid: Pid,
        termination: ChildTermination,
    },
}

/// Sending side of the control channel. Cheap to clone, usable from any thread.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    tx: Sender<ControlEvent>,
    wake: Arc<UnixStream>,
}

impl ControlHandle {
    /// Queue an event and wake the control loop. Returns false if the loop is gone.
    pub fn send(&self, event: ControlEvent) -> bool {
        if self.tx.send(event).is_err() {
            return false;
        }
        // a full wake pipe already guarantees a pending wakeup
        if let Err(e) = (&*self.wake).write(&[1]) {
            if e.kind() != std::io::ErrorKind::WouldBlock {
                trace!("Could not write to the wake pipe: {e}");
            }
        }
        true
    }

    pub fn request_reload(&self) -> bool {
        self.send(ControlEvent::Reload)
    }

    pub fn request_shutdown(&self) -> bool {
        self.send(ControlEvent::Shutdown)
    }

    pub fn request_status_dump(&self) -> bool {
        self.send(ControlEvent::StatusDump)
    }

    pub fn child_exited(&self, pid: Pid, termination: ChildTermination) -> bool {
        self.send(ControlEvent::ChildExited { pid, termination })
    }

    /// Ask the control loop for a snapshot of all entries
    #[must_use]
    pub fn status(&self, timeout: Duration) -> Option<Vec<EntryStatus>> {
        let (tx, rx) = mpsc::channel();
        if !self.send(ControlEvent::Status(tx)) {
            return None;
        }
        rx.recv_timeout(timeout).ok()
    }
}

/// Receiving side, owned by the control loop
#[derive(Debug)]
pub struct ControlChannel {
    rx: Receiver<ControlEvent>,
    wake: UnixStream,
    handle: ControlHandle,
}

impl ControlChannel {
    pub fn new() -> std::io::Result<Self> {
        let (wake_read, wake_write) = UnixStream::pair()?;
        wake_read.set_nonblocking(true)?;
        wake_write.set_nonblocking(true)?;
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            rx,
            wake: wake_read,
            handle: ControlHandle {
                tx,
                wake: Arc::new(wake_write),
            },
        })
    }

    #[must_use]
    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Consume pending wake bytes, then everything queued so far.
    /// Events queued after this returns leave a wake byte behind.
    pub fn drain(&self) -> Vec<ControlEvent> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        self.rx.try_iter().collect()
    }

    /// Block for the next event, used once the sockets are closed
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ControlEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl AsFd for ControlChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_order() {
        let channel = ControlChannel::new().unwrap();
        let handle = channel.handle();
        assert!(handle.request_reload());
        assert!(handle.child_exited(Pid::from_raw(42), ChildTermination::Exit(3)));

        let events = channel.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ControlEvent::Reload));
        assert!(matches!(
            events[1],
            ControlEvent::ChildExited {
                termination: ChildTermination::Exit(3),
                ..
            }
        ));
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn send_fails_once_loop_is_gone() {
        let channel = ControlChannel::new().unwrap();
        let handle = channel.handle();
        drop(channel);
        assert!(!handle.request_shutdown());
        assert!(handle.status(Duration::from_millis(10)).is_none());
    }
}
