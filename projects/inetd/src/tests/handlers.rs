//! Real handler processes, real signals.
//!
//! Signal handlers are process wide and the signal thread reaps every child of
//! the test binary, so everything that needs them lives in this one test.

use super::{free_addr, with_timeout};
use crate::config::Config;
use crate::control::{ControlChannel, ControlHandle};
use crate::entries::SystemResolver;
use crate::registry::{EntryState, EntryStatus};
use crate::reload::FileConfigSource;
use crate::server::Server;
use crate::services::ProcessSpawner;
use crate::signal_handler::SignalWatcher;
use crate::throttle::ThrottlePolicy;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PATIENCE: Duration = Duration::from_secs(10);

struct Ports {
    echo: SocketAddr,
    slow: SocketAddr,
    dgram: SocketAddr,
    failing: SocketAddr,
    blocked: SocketAddr,
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn conf_line(addr: SocketAddr, transport: &str, wait: &str, script: &Path) -> String {
    let protocol = if transport == "stream" { "tcp" } else { "udp" };
    format!(
        "{addr} {transport} {protocol} {wait} {}:{} /bin/sh sh {}\n",
        nix::unistd::geteuid(),
        nix::unistd::getegid(),
        script.display()
    )
}

fn write_conf(path: &Path, lines: &[String]) {
    std::fs::write(path, lines.concat()).unwrap();
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < PATIENCE, "gave up waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn status_of(handle: &ControlHandle, addr: SocketAddr) -> Option<EntryStatus> {
    handle
        .status(PATIENCE)
        .unwrap()
        .into_iter()
        .find(|status| status.local_addr == Some(addr))
}

fn exchange(addr: SocketAddr, line: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(PATIENCE)).unwrap();
    stream.write_all(line.as_bytes()).unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    reply
}

fn check_nowait_echo(ports: &Ports) {
    assert_eq!(exchange(ports.echo, "hello\n"), "hello\n");
    assert_eq!(exchange(ports.echo, "again\n"), "again\n");
}

fn check_wait_serializes(ports: &Ports) {
    let start = Instant::now();
    let clients = ["one", "two"]
        .into_iter()
        .map(|word| {
            let addr = ports.slow;
            std::thread::spawn(move || (exchange(addr, &format!("{word}\n")), start.elapsed()))
        })
        .collect::<Vec<_>>();
    let mut results = clients
        .into_iter()
        .map(|client| client.join().unwrap())
        .collect::<Vec<_>>();
    results.sort_by_key(|(_, elapsed)| *elapsed);
    let mut replies = results
        .iter()
        .map(|(reply, _)| reply.as_str())
        .collect::<Vec<_>>();
    replies.sort_unstable();
    assert_eq!(replies, vec!["one\n", "two\n"]);
    // one handler at a time: the second reply needs two sleeps
    assert!(results[1].1 >= Duration::from_millis(550), "{results:?}");
}

fn check_datagram_wait(ports: &Ports, marker: &Path) {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .send_to(b"ping", ports.dgram)
        .unwrap();
    let lines = || {
        std::fs::read_to_string(marker)
            .map(|content| content.lines().count())
            .unwrap_or(0)
    };
    wait_for("datagram handler", || lines() == 1);
    // the handler consumed the datagram, nothing is left to dispatch
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(lines(), 1);
}

fn check_throttle(handle: &ControlHandle, ports: &Ports) {
    // nothing is sent, unread input would turn the close into a reset
    for _ in 0..3 {
        assert_eq!(exchange(ports.failing, ""), "");
    }
    wait_for("failing service to be disabled", || {
        matches!(
            status_of(handle, ports.failing).map(|status| status.state),
            Some(EntryState::Disabled(_))
        )
    });
    wait_for("failing service to come back", || {
        status_of(handle, ports.failing).map(|status| status.state)
            == Some(EntryState::Listening)
    });
}

fn check_sighup_reload(handle: &ControlHandle, ports: &Ports, conf: &Path, kept: &[String]) {
    let slow_fd = status_of(handle, ports.slow).unwrap().fd;
    write_conf(conf, kept);
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).unwrap();
    wait_for("echo to be removed", || {
        TcpStream::connect(ports.echo).is_err()
    });
    assert_eq!(status_of(handle, ports.slow).unwrap().fd, slow_fd);
    assert!(status_of(handle, ports.echo).is_none());
}

fn end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let echo = script(dir.path(), "echo.sh", "read line\necho \"$line\"\n");
    let slow = script(dir.path(), "slow.sh", "read line\nsleep 0.3\necho \"$line\"\n");
    let dgram = script(
        dir.path(),
        "dgram.sh",
        &format!(
            "dd bs=1024 count=1 of=/dev/null 2>/dev/null\necho got >> {}\n",
            marker.display()
        ),
    );
    let failing = script(dir.path(), "failing.sh", "exit 1\n");

    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let ports = Ports {
        echo: free_addr(),
        slow: free_addr(),
        dgram: UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap(),
        failing: free_addr(),
        blocked: taken.local_addr().unwrap(),
    };
    let kept = vec![
        conf_line(ports.slow, "stream", "wait", &slow),
        conf_line(ports.dgram, "dgram", "wait", &dgram),
        conf_line(ports.failing, "stream", "nowait", &failing),
        conf_line(ports.blocked, "stream", "nowait", &echo),
    ];
    let mut all = vec![conf_line(ports.echo, "stream", "nowait", &echo)];
    all.extend(kept.iter().cloned());
    let conf = dir.path().join("inetd.conf");
    write_conf(&conf, &all);

    let mut config = Config::new("inetd", conf.clone());
    config.throttle = ThrottlePolicy {
        max_failures: 3,
        window: Duration::from_secs(10),
        backoff: Duration::from_secs(1),
        min_runtime: Duration::ZERO,
    };
    config.shutdown_grace = Duration::from_secs(2);

    let control = ControlChannel::new().unwrap();
    let watcher = SignalWatcher::start(control.handle()).unwrap();
    let source = FileConfigSource::new(conf.clone(), SystemResolver::new(config.services_db.clone()));
    let server = Server::new(&config, Box::new(source), control, ProcessSpawner::new("inetd"));
    let handle = server.handle();
    let thread = std::thread::spawn(move || server.run());

    // a busy address only costs that one service
    let status = handle.status(PATIENCE).unwrap();
    assert_eq!(status.len(), 4, "{status:?}");
    assert!(status_of(&handle, ports.blocked).is_none());

    check_nowait_echo(&ports);
    check_wait_serializes(&ports);
    check_datagram_wait(&ports, &marker);
    check_throttle(&handle, &ports);
    check_sighup_reload(&handle, &ports, &conf, &kept);

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
    wait_for("control loop to stop", || thread.is_finished());
    thread.join().unwrap().unwrap();
    watcher.stop();

    assert!(TcpStream::connect(ports.slow).is_err());
    assert!(TcpStream::connect(ports.failing).is_err());
    drop(taken);
}

#[test]
fn test_handlers_end_to_end() {
    with_timeout(Duration::from_secs(120), end_to_end);
}
