mod handlers;

use crate::entries::{Concurrency, ParsedConfig, Protocol, Resolver, RunAs, ServiceSpec, Transport};
use crate::reload::ConfigSource;
use crate::services::{SpawnError, Spawner};

use nix::unistd::Pid;

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Run `test` on its own thread and fail if it does not finish within `timeout`.
/// Tests that wait on the control loop would otherwise hang forever on a bug.
pub fn with_timeout(timeout: std::time::Duration, test: fn()) {
    let handle = std::thread::spawn(test);
    let start = std::time::Instant::now();
    loop {
        if handle.is_finished() {
            handle.join().unwrap();
            return;
        }
        if start.elapsed() >= timeout {
            panic!("test timed out after {timeout:?}");
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

/// The identity the test process runs with
pub fn test_user() -> RunAs {
    RunAs {
        name: "tester".to_owned(),
        group: None,
        uid: nix::unistd::geteuid(),
        gid: nix::unistd::getegid(),
        groups: vec![],
    }
}

/// Build a spec that listens on `service`, which has to be a socket address.
/// A relative `argv[0]` is looked up in /bin.
pub fn test_spec(service: &str, transport: Transport, wait: bool, argv: &[&str]) -> ServiceSpec {
    let listen: SocketAddr = service.parse().unwrap();
    let protocol = match (transport, listen.is_ipv6()) {
        (Transport::Stream, false) => Protocol::Tcp,
        (Transport::Stream, true) => Protocol::Tcp6,
        (Transport::Datagram, false) => Protocol::Udp,
        (Transport::Datagram, true) => Protocol::Udp6,
    };
    let program = if argv[0].starts_with('/') {
        PathBuf::from(argv[0])
    } else {
        PathBuf::from("/bin").join(argv[0])
    };
    ServiceSpec {
        name: service.to_owned(),
        transport,
        protocol,
        concurrency: if wait {
            Concurrency::Wait
        } else {
            Concurrency::Nowait
        },
        user: test_user(),
        program,
        args: argv.iter().map(|arg| (*arg).to_owned()).collect(),
        listen,
    }
}

/// Knows a handful of services and users, no system databases involved
pub struct FakeResolver;

impl Resolver for FakeResolver {
    fn port(&self, service: &str, _protocol: Protocol) -> Result<u16, String> {
        if let Ok(port) = service.parse() {
            return Ok(port);
        }
        match service {
            "echo" => Ok(7),
            "discard" => Ok(9),
            "daytime" => Ok(13),
            "chargen" => Ok(19),
            "tftp" => Ok(69),
            _ => Err(format!("no such service: {service}")),
        }
    }

    fn user(&self, user: &str, group: Option<&str>) -> Result<RunAs, String> {
        let (uid, mut gid) = match user {
            "root" => (0, 0),
            "nobody" => (65534, 65534),
            _ => return Err(format!("no such user: {user}")),
        };
        if let Some(group) = group {
            gid = match group {
                "root" => 0,
                "nogroup" => 65534,
                numeric => numeric
                    .parse()
                    .map_err(|_| format!("no such group: {group}"))?,
            };
        }
        Ok(RunAs {
            name: user.to_owned(),
            group: group.map(str::to_owned),
            uid: nix::unistd::Uid::from_raw(uid),
            gid: nix::unistd::Gid::from_raw(gid),
            groups: vec![nix::unistd::Gid::from_raw(gid)],
        })
    }
}

/// One call to `FakeSpawner::spawn`
#[derive(Clone, Debug)]
pub struct Spawned {
    pub service: String,
    pub pid: Pid,
    pub fd: RawFd,
}

/// Hands out made up pids instead of forking. Clones share their log.
#[derive(Clone, Debug, Default)]
pub struct FakeSpawner {
    pub log: Arc<Mutex<Vec<Spawned>>>,
    pub fail: bool,
}

impl FakeSpawner {
    pub fn spawned(&self) -> Vec<Spawned> {
        self.log.lock().unwrap().clone()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&mut self, spec: &ServiceSpec, conn: BorrowedFd<'_>) -> Result<Pid, SpawnError> {
        if self.fail {
            return Err(SpawnError::Fork(nix::Error::EAGAIN));
        }
        let mut log = self.log.lock().unwrap();
        let pid = Pid::from_raw(100_000 + log.len() as i32);
        log.push(Spawned {
            service: spec.name.clone(),
            pid,
            fd: conn.as_raw_fd(),
        });
        Ok(pid)
    }
}

/// An address nothing listens on right now
pub fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Serves whatever specs the test put in, None reads as a missing file
#[derive(Clone, Default)]
pub struct StaticSource {
    specs: Arc<Mutex<Option<Vec<ServiceSpec>>>>,
}

impl StaticSource {
    pub fn set(&self, specs: Option<Vec<ServiceSpec>>) {
        *self.specs.lock().unwrap() = specs;
    }
}

impl ConfigSource for StaticSource {
    fn load(&self) -> std::io::Result<ParsedConfig> {
        match self.specs.lock().unwrap().clone() {
            Some(specs) => Ok(ParsedConfig {
                specs,
                errors: vec![],
            }),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }

    fn describe(&self) -> String {
        "static".to_owned()
    }
}
