//! Wait until a watched socket is readable, the control channel has events or
//! the next deadline of the registry is reached.

use log::trace;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::control::ControlChannel;
use crate::registry::{EntryId, ServiceRegistry};

use std::os::unix::io::AsFd;
use std::time::{Duration, Instant};

/// What woke the multiplexer. Both parts may be empty on a spurious wakeup.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Readiness {
    pub sockets: Vec<EntryId>,
    pub control: bool,
}

impl Readiness {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty() && !self.control
    }
}

/// Longest single wait, the loop recomputes deadlines after it anyway
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

fn timeval(timeout: Duration) -> TimeVal {
    let micros = timeout.min(MAX_WAIT).as_micros();
    TimeVal::microseconds(i64::try_from(micros).unwrap_or(i64::MAX))
}

/// Block until something needs the control loop's attention.
///
/// Only entries that are neither busy nor disabled are watched. `deadline`
/// bounds the wait, `None` blocks until a socket or the control channel fires.
pub fn wait_for_events(
    registry: &ServiceRegistry,
    control: &ControlChannel,
    deadline: Option<Instant>,
) -> Result<Readiness, nix::Error> {
    let mut fdset = FdSet::new();
    let mut watched = Vec::new();
    for (id, entry) in registry.iter() {
        if entry.is_watchable() {
            let fd = entry.socket.as_fd();
            fdset.insert(fd);
            watched.push((id, fd));
        }
    }
    let control_fd = control.as_fd();
    fdset.insert(control_fd);

    let mut timeout = deadline.map(|deadline| {
        timeval(deadline.saturating_duration_since(Instant::now()))
    });
    trace!(
        "Waiting on {} sockets, timeout {:?}",
        watched.len(),
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    );

    match select(None, Some(&mut fdset), None, None, timeout.as_mut()) {
        Ok(_) => Ok(Readiness {
            sockets: watched
                .iter()
                .filter(|(_, fd)| fdset.contains(*fd))
                .map(|(id, _)| *id)
                .collect(),
            control: fdset.contains(control_fd),
        }),
        Err(nix::Error::EINTR) => Ok(Readiness::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::Transport;
    use crate::registry::ServiceEntry;
    use crate::sockets::SocketBinder;
    use crate::tests::test_spec;

    fn add(registry: &mut ServiceRegistry, transport: Transport) -> EntryId {
        let spec = test_spec("127.0.0.1:0", transport, false, &["true"]);
        let socket = SocketBinder::default().bind(&spec).unwrap();
        registry.add(ServiceEntry::new(spec, socket))
    }

    // signals sent to other tests in this process may interrupt the select
    fn wait_until_ready(registry: &ServiceRegistry, control: &ControlChannel) -> Readiness {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let ready = wait_for_events(registry, control, Some(deadline)).unwrap();
            if !ready.is_empty() || Instant::now() >= deadline {
                return ready;
            }
        }
    }

    #[test]
    fn times_out_without_activity() {
        let mut registry = ServiceRegistry::new();
        add(&mut registry, Transport::Stream);
        let control = ControlChannel::new().unwrap();

        let start = Instant::now();
        let ready = wait_for_events(
            &registry,
            &control,
            Some(start + Duration::from_millis(50)),
        )
        .unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn reports_readable_socket() {
        let mut registry = ServiceRegistry::new();
        let quiet = add(&mut registry, Transport::Stream);
        let busy = add(&mut registry, Transport::Datagram);
        let control = ControlChannel::new().unwrap();

        let target = registry.get(busy).unwrap().socket.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", target).unwrap();

        let ready = wait_until_ready(&registry, &control);
        assert_eq!(ready.sockets, vec![busy]);
        assert!(!ready.sockets.contains(&quiet));
        assert!(!ready.control);
    }

    #[test]
    fn parked_sockets_are_not_watched() {
        let mut registry = ServiceRegistry::new();
        let id = add(&mut registry, Transport::Datagram);
        registry
            .get_mut(id)
            .unwrap()
            .park(nix::unistd::Pid::from_raw(1), None);
        let control = ControlChannel::new().unwrap();

        let target = registry.get(id).unwrap().socket.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", target).unwrap();

        let ready = wait_for_events(
            &registry,
            &control,
            Some(Instant::now() + Duration::from_millis(50)),
        )
        .unwrap();
        assert!(ready.sockets.is_empty());
    }

    #[test]
    fn control_events_wake_the_wait() {
        let registry = ServiceRegistry::new();
        let control = ControlChannel::new().unwrap();
        let handle = control.handle();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.request_reload();
        });

        let ready = wait_until_ready(&registry, &control);
        assert!(ready.control);
        assert_eq!(control.drain().len(), 1);
        sender.join().unwrap();
    }
}
