// Thin wrappers around kill(2) / killpg(2) used by the stop escalation

use std::io;
use std::process::ExitStatus;

/// Escalation signals, in the order they are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Who receives the escalation signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(libc::pid_t),
    Group(libc::pid_t),
}

impl SignalTarget {
    /// Resolve the target for `pid`, looking up its process group if requested
    pub fn resolve(pid: u32, as_process_group: bool) -> io::Result<Self> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        if !as_process_group {
            return Ok(SignalTarget::Process(pid));
        }

        let pgid = unsafe { libc::getpgid(pid) };
        if pgid < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SignalTarget::Group(pgid))
    }

    pub fn send(self, signal: Signal) -> io::Result<()> {
        let rc = match self {
            SignalTarget::Process(pid) => unsafe { libc::kill(pid, signal.as_raw()) },
            SignalTarget::Group(pgid) => unsafe { libc::killpg(pgid, signal.as_raw()) },
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// True if the error means the process (group) no longer exists
pub fn is_process_gone(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

/// Map an exit status to an integer code, death by signal N becomes -N
pub fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}
