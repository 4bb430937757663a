use super::spawn::{Identity, PreparedExec};

use std::os::unix::io::RawFd;

/// Exit status of a handler whose identity could not be assumed
pub const EXIT_PRIVILEGES: i32 = 126;
/// Exit status of a handler whose program could not be executed
pub const EXIT_EXEC: i32 = 127;

/// Signals whose dispositions the daemon changes, reset before exec
const RESET_SIGNALS: [libc::c_int; 7] = [
    libc::SIGCHLD,
    libc::SIGHUP,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGPIPE,
];

/// Turn the freshly forked child into the handler for `conn`.
///
/// Runs between fork and exec, so only async-signal-safe calls are allowed:
/// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
/// All signals are blocked on entry, the parent blocked them before forking.
pub fn after_fork_child(exec: &PreparedExec, argv: &[*const libc::c_char], conn: RawFd) -> ! {
    // DO NOT USE THE LOGGER HERE. It acquires a global lock which might be held at the time of forking
    // But since this is the only thread that is in the child process the lock will never be released!

    // keep a way to complain after stderr got replaced by the connection
    let diag = unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_DUPFD_CLOEXEC, 3) };

    // detach from the daemon's session, signals for its process group must not reach handlers
    unsafe { libc::setsid() };

    if let Some(identity) = &exec.identity {
        if !drop_privileges(identity) {
            write_diag(diag, &exec.privileges_failed);
            unsafe { libc::_exit(EXIT_PRIVILEGES) };
        }
    }

    if !dup_stdio(conn) {
        write_diag(diag, &exec.stdio_failed);
        unsafe { libc::_exit(EXIT_EXEC) };
    }

    reset_signals();

    unsafe { libc::execv(exec.program.as_ptr(), argv.as_ptr()) };
    write_diag(diag, &exec.exec_failed);
    unsafe { libc::_exit(EXIT_EXEC) }
}

fn write_diag(fd: RawFd, msg: &[u8]) {
    if fd < 0 {
        return;
    }
    unsafe {
        libc::write(fd, msg.as_ptr().cast(), msg.len() as _);
    }
}

/// Groups first, uid last. Once the uid is dropped the rest would be denied.
fn drop_privileges(identity: &Identity) -> bool {
    unsafe {
        if libc::setgroups(identity.groups.len() as _, identity.groups.as_ptr()) != 0 {
            return false;
        }
        if libc::setgid(identity.gid) != 0 {
            return false;
        }
        libc::setuid(identity.uid) == 0
    }
}

/// Make `conn` the handler's stdin, stdout and stderr
fn dup_stdio(conn: RawFd) -> bool {
    let mut fd = conn;
    if fd <= libc::STDERR_FILENO {
        // rescue it, the dup2 calls below would overwrite it
        fd = unsafe { libc::fcntl(fd, libc::F_DUPFD, libc::STDERR_FILENO + 1) };
        if fd < 0 {
            return false;
        }
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } != target {
            return false;
        }
    }
    unsafe { libc::close(fd) };
    true
}

/// Default dispositions and an empty mask, the way a freshly started program expects them
fn reset_signals() {
    unsafe {
        for signal in RESET_SIGNALS {
            libc::signal(signal, libc::SIG_DFL);
        }
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    }
}
