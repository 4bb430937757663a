//! Start handler processes.
//!
//! Everything that allocates happens here, before the fork. The child only
//! runs `fork_child::after_fork_child`, which sticks to async-signal-safe calls.

use log::{trace, warn};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use nix::unistd::{ForkResult, Pid};

use super::fork_child;
use crate::entries::ServiceSpec;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd};

/// Starts a handler for a service with `conn` as its standard streams.
/// The descriptor stays owned by the caller, who closes its copy afterwards.
pub trait Spawner {
    fn spawn(&mut self, spec: &ServiceSpec, conn: BorrowedFd<'_>) -> Result<Pid, SpawnError>;
}

#[derive(Debug)]
pub enum SpawnError {
    /// The program path or an argument contains a NUL byte
    BadArgument(String),
    Fork(nix::Error),
    SignalMask(nix::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::BadArgument(arg) => write!(f, "argument {arg:?} contains a NUL byte"),
            Self::Fork(e) => write!(f, "fork failed: {e}"),
            Self::SignalMask(e) => write!(f, "could not block signals for fork: {e}"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Identity to switch to in the child
#[derive(Debug)]
pub struct Identity {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
}

/// Everything the child needs, built before forking
#[derive(Debug)]
pub struct PreparedExec {
    pub program: CString,
    pub argv: Vec<CString>,
    /// None if the handler runs with the daemon's own identity
    pub identity: Option<Identity>,
    pub privileges_failed: Vec<u8>,
    pub stdio_failed: Vec<u8>,
    pub exec_failed: Vec<u8>,
}

fn cstring(bytes: &[u8]) -> Result<CString, SpawnError> {
    CString::new(bytes)
        .map_err(|_| SpawnError::BadArgument(String::from_utf8_lossy(bytes).into_owned()))
}

impl PreparedExec {
    pub fn new(spec: &ServiceSpec, prog_name: &str) -> Result<Self, SpawnError> {
        let program = cstring(spec.program.as_os_str().as_bytes())?;
        let argv = spec
            .args
            .iter()
            .map(|arg| cstring(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let identity = if spec.user.uid == nix::unistd::geteuid()
            && spec.user.gid == nix::unistd::getegid()
        {
            None
        } else {
            let mut groups = spec
                .user
                .groups
                .iter()
                .map(|gid| gid.as_raw())
                .collect::<Vec<_>>();
            if !groups.contains(&spec.user.gid.as_raw()) {
                groups.insert(0, spec.user.gid.as_raw());
            }
            Some(Identity {
                uid: spec.user.uid.as_raw(),
                gid: spec.user.gid.as_raw(),
                groups,
            })
        };

        let diag = |what: String| format!("{prog_name}: {}: {what}\n", spec.name).into_bytes();
        Ok(Self {
            privileges_failed: diag(format!("could not switch to user {}", spec.user.name)),
            stdio_failed: diag("could not set up standard streams".to_owned()),
            exec_failed: diag(format!("could not execute {}", spec.program.display())),
            program,
            argv,
            identity,
        })
    }

    /// NULL terminated pointer array for execv, borrowing from `self`
    #[must_use]
    pub fn argv_ptrs(&self) -> Vec<*const libc::c_char> {
        self.argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }
}

/// Forks and execs the configured program
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    prog_name: String,
}

impl ProcessSpawner {
    #[must_use]
    pub fn new(prog_name: &str) -> Self {
        Self {
            prog_name: prog_name.to_owned(),
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, spec: &ServiceSpec, conn: BorrowedFd<'_>) -> Result<Pid, SpawnError> {
        let exec = PreparedExec::new(spec, &self.prog_name)?;
        let argv = exec.argv_ptrs();
        let conn = conn.as_raw_fd();

        // the child must not run the daemon's signal handlers before exec
        let mut old_mask = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut old_mask),
        )
        .map_err(SpawnError::SignalMask)?;

        let forked = match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Child) => fork_child::after_fork_child(&exec, &argv, conn),
            Ok(ForkResult::Parent { child }) => Ok(child),
            Err(e) => Err(SpawnError::Fork(e)),
        };

        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None) {
            warn!("Could not restore the signal mask after fork: {e}");
        }

        let pid = forked?;
        trace!(
            "Started handler {pid} for {}: {}",
            spec.name,
            crate::entries::argv_to_string(&spec.args)
        );
        Ok(pid)
    }
}
