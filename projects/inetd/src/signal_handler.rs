//! Handle signals sent to this process from either the outside or the handler processes
//!
//! A dedicated thread waits on signal-hook's iterator and turns every delivery
//! into a `ControlEvent`. Children are reaped right here with `waitpid`; the
//! control loop only ever learns about already reaped pids.

use crate::control::ControlHandle;

use log::{error, info, trace};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::iterator::{Handle, Signals};

use std::thread::JoinHandle;

/// Owns the signal thread. Dropping it unregisters the handlers and joins the thread.
pub struct SignalWatcher {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn start(control: ControlHandle) -> std::io::Result<Self> {
        let signals = Signals::new([SIGCHLD, SIGHUP, SIGTERM, SIGINT, SIGQUIT, SIGUSR1])?;
        let handle = signals.handle();
        let thread = std::thread::Builder::new()
            .name("signals".into())
            .spawn(move || handle_signals(signals, &control))?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Signal thread panicked");
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn handle_signals(mut signals: Signals, control: &ControlHandle) {
    for signal in signals.forever() {
        match signal as libc::c_int {
            SIGCHLD => {
                std::iter::from_fn(get_next_exited_child)
                    .take_while(Result::is_ok)
                    .for_each(|val| match val {
                        Ok((pid, termination)) => {
                            trace!("Reaped pid {pid}: {termination}");
                            control.child_exited(pid, termination);
                        }
                        Err(e) => error!("{e}"),
                    });
            }
            SIGHUP => {
                info!("Received SIGHUP, rereading configuration");
                control.request_reload();
            }
            SIGUSR1 => {
                control.request_status_dump();
            }
            SIGTERM | SIGINT | SIGQUIT => {
                info!("Received termination signal");
                control.request_shutdown();
            }
            _ => unreachable!(),
        }
    }
    trace!("Signal thread exiting");
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum ChildTermination {
    Signal(nix::sys::signal::Signal),
    Exit(i32),
}

impl std::fmt::Display for ChildTermination {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Signal(sig) => write!(f, "signal {sig}"),
            Self::Exit(code) => write!(f, "exit code {code}"),
        }
    }
}

impl ChildTermination {
    #[must_use]
    pub const fn success(&self) -> bool {
        match self {
            Self::Signal(_) => false,
            Self::Exit(code) => *code == 0,
        }
    }
}

type ChildIterElem = Result<(nix::unistd::Pid, ChildTermination), nix::Error>;

fn get_next_exited_child() -> Option<ChildIterElem> {
    let wait_any_pid = nix::unistd::Pid::from_raw(-1);
    let wait_flags = nix::sys::wait::WaitPidFlag::WNOHANG;
    loop {
        match nix::sys::wait::waitpid(wait_any_pid, Some(wait_flags)) {
            Ok(nix::sys::wait::WaitStatus::Exited(pid, code)) => {
                return Some(Ok((pid, ChildTermination::Exit(code))));
            }
            Ok(nix::sys::wait::WaitStatus::Signaled(pid, signal, _dumped_core)) => {
                return Some(Ok((pid, ChildTermination::Signal(signal))));
            }
            Ok(nix::sys::wait::WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => return None,
            Ok(other) => {
                // stop/continue of children is of no interest
                trace!("Ignored child state change: {other:?}");
            }
            Err(nix::Error::EINTR) => {}
            Err(e) => return Some(Err(e)),
        }
    }
}
