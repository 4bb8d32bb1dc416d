use std::{
    fmt::Display,
    os::fd::{AsRawFd, OwnedFd},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{killpg, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

use crate::{
    cgroup::CgroupWrapper,
    error::{Error, JailStage, LaunchError},
};

/// Terminal state of a reaped guest. A guest that is still running has no
/// result yet; nothing else is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Guest exited on its own; carries the exit code (0..=255).
    Exited(i32),
    /// Guest was taken down by an uncaught signal; carries the signal
    /// number. Resource-limit kills from the accounting loop land here.
    Signaled(i32),
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        matches!(self, ExecutionResult::Exited(0))
    }
    pub fn code(&self) -> i32 {
        match self {
            ExecutionResult::Exited(code) => *code,
            ExecutionResult::Signaled(signal) => *signal,
        }
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionResult::Exited(code) => write!(f, "exit with code {}", code),
            ExecutionResult::Signaled(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

/// Reap state machine for one forked guest: pid, the report pipe's read
/// end, and whether the corpse was already collected.
#[derive(Debug)]
pub(crate) struct ChildHandle {
    pid: Pid,
    report: OwnedFd,
    reaped: bool,
}

impl ChildHandle {
    pub(crate) fn new(pid: Pid, report: OwnedFd) -> Self {
        Self {
            pid,
            report,
            reaped: false,
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn reaped(&self) -> bool {
        self.reaped
    }

    /// Block until the guest reaches a terminal state and classify it.
    ///
    /// Stopped/continued reports are not terminal and are waited through.
    /// A handle is consumed by its first reap; later calls fail the same
    /// way the kernel would refuse an unknown pid.
    pub(crate) fn wait(&mut self) -> Result<ExecutionResult, Error> {
        if self.reaped {
            return Err(Error::WaitFailed(Errno::ECHILD));
        }
        let result = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExecutionResult::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    break ExecutionResult::Signaled(signal as i32)
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    self.reaped = true;
                    return Err(Error::WaitFailed(errno));
                }
            }
        };
        self.reaped = true;

        // A report before EOF means the jail, not the guest program,
        // failed; EOF alone means exec succeeded and `result` stands.
        match self.read_report() {
            Some((JailStage::Exec, errno)) => Err(Error::ExecFailed(errno)),
            Some((stage, errno)) => Err(Error::LaunchFailed(LaunchError::Guest { stage, errno })),
            None => Ok(result),
        }
    }

    /// SIGKILL the guest's process group, catching its descendants.
    pub(crate) fn kill_group(&self) -> nix::Result<()> {
        killpg(self.pid, Signal::SIGKILL)
    }

    fn read_report(&self) -> Option<(JailStage, Errno)> {
        let fd = self.report.as_raw_fd();
        let mut buf = [0u8; 8];
        let mut got = 0;
        while got < buf.len() {
            let n = unsafe {
                libc::read(
                    fd,
                    buf[got..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - got,
                )
            };
            match n {
                0 => break,
                n if n < 0 => match Errno::last() {
                    Errno::EINTR => continue,
                    _ => break,
                },
                n => got += n as usize,
            }
        }
        if got < buf.len() {
            return None;
        }

        let stage = u32::from_le_bytes(buf[..4].try_into().ok()?);
        let errno = i32::from_le_bytes(buf[4..].try_into().ok()?);
        Some((
            // a mangled stage can only come from the exec window
            JailStage::from_raw(stage).unwrap_or(JailStage::Exec),
            Errno::from_i32(errno),
        ))
    }
}

/// Handle of one launched sandbox: enough to signal the guest, sample its
/// accounting group and reap its result. Dropping an unreaped handle kills
/// the guest's process group and collects the corpse.
#[derive(Debug)]
pub struct SandboxProcess {
    child: ChildHandle,
    cgroup: CgroupWrapper,
}

impl SandboxProcess {
    pub(crate) fn new(child: ChildHandle, cgroup: CgroupWrapper) -> Self {
        Self { child, cgroup }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.child.pid().as_raw()
    }

    /// Accounting group this guest was registered in before it could spawn
    /// anything; the external loop samples it under this name.
    pub fn cgroup(&self) -> &CgroupWrapper {
        &self.cgroup
    }

    pub fn cgroup_name(&self) -> &str {
        self.cgroup.name()
    }

    /// SIGKILL the guest and every descendant in its process group. The
    /// accounting loop calls this on timeout or OOM and then reaps
    /// normally; a kill is just another `Signaled` result.
    pub fn kill(&self) -> nix::Result<()> {
        self.child.kill_group()
    }

    /// Block until the guest terminates and classify the outcome. A handle
    /// can be reaped exactly once; the second call returns `WaitFailed`.
    pub fn wait(&mut self) -> Result<ExecutionResult, Error> {
        self.child.wait()
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        if !self.child.reaped() {
            let _ = self.child.kill_group();
            let _ = self.child.wait();
        }
        if let Err(err) = self.cgroup.delete() {
            log::debug!("leaving cgroup `{}` behind: {}", self.cgroup.name(), err);
        }
    }
}
