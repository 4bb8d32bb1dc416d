//! Guest-side half of the launcher.
//!
//! Everything here runs between `fork` and `execve`, after the controller
//! has lost its synchronous error channel: failures are written to the
//! inherited close-on-exec pipe as a `{stage, errno}` report and the guest
//! self-terminates. Nothing in this module logs or touches controller
//! state; all path and credential resolution happened before the fork.

use std::{
    ffi::CString,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    mount::{mount, MsFlags},
    sched::{unshare, CloneFlags},
    sys::resource::{setrlimit, Resource},
    unistd::{chdir, chroot, execve, setgid, setgroups, setpgid, setuid, Gid, Pid, Uid},
};

use crate::{
    error::{Error, JailStage},
    semaphore::Semaphore,
};

/// Working mount as the guest sees it after chroot; must stay in step with
/// [`crate::param::WORKING_MOUNT_POINT`].
const JAIL_WORKING_DIR: &str = "/sandbox/working";

/// Exit code of a guest that failed before or at exec. The report on the
/// pipe is authoritative; the code only marks the corpse for accounting.
pub(crate) const SETUP_FAILED_EXIT: libc::c_int = 127;

/// One stdio redirection, resolved to a C path before the fork.
pub(crate) struct Redirection {
    path: CString,
    target: RawFd,
    flags: libc::c_int,
}

impl Redirection {
    pub(crate) fn input(path: CString) -> Self {
        Self {
            path,
            target: libc::STDIN_FILENO,
            flags: libc::O_RDONLY,
        }
    }
    pub(crate) fn output(path: CString, target: RawFd) -> Self {
        Self {
            path,
            target,
            flags: libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        }
    }

    fn apply(&self) -> nix::Result<()> {
        let fd = unsafe { libc::open(self.path.as_ptr(), self.flags, 0o644) };
        if fd < 0 {
            return Err(Errno::last());
        }
        if unsafe { libc::dup2(fd, self.target) } < 0 {
            let errno = Errno::last();
            unsafe { libc::close(fd) };
            return Err(errno);
        }
        unsafe { libc::close(fd) };
        Ok(())
    }
}

/// Everything the guest needs after the fork, resolved while errors could
/// still be returned to the caller.
pub(crate) struct JailContext {
    pub exec: CString,
    pub argv: Vec<CString>,
    pub envp: Vec<CString>,
    pub chroot_directory: PathBuf,
    pub binary_directory: PathBuf,
    pub working_directory: PathBuf,
    pub binary_mount: PathBuf,
    pub working_mount: PathBuf,
    pub proc_mount: PathBuf,
    pub mount_proc: bool,
    pub redirect_before_chroot: bool,
    pub redirections: Vec<Redirection>,
    pub process_limit: Option<u64>,
    pub uid: Uid,
    pub gid: Gid,
    pub report_fd: RawFd,
}

/// Jail the calling process and exec the guest image. Never returns.
///
/// Order is load bearing: mounts and chroot need elevated rights and come
/// first, the rlimit survives the privilege drop, and the drop itself must
/// precede the handshake so no guest instruction runs privileged. The
/// handshake wait keeps the guest from spawning anything before the
/// controller has it on the cgroup's task list.
pub(crate) fn enter(ctx: &JailContext, sem: &Semaphore) -> ! {
    // own process group, so a group signal reaches every descendant
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

    if ctx.redirect_before_chroot {
        if let Err(errno) = apply_redirections(ctx) {
            fail(ctx, JailStage::Redirect, errno);
        }
    }

    // private mount namespace: the binds below must not leak to the host
    if let Err(errno) = unshare(CloneFlags::CLONE_NEWNS) {
        fail(ctx, JailStage::Namespace, errno);
    }
    if let Err(errno) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        fail(ctx, JailStage::Namespace, errno);
    }

    if let Err(errno) = bind(&ctx.binary_directory, &ctx.binary_mount) {
        fail(ctx, JailStage::Mount, errno);
    }
    if let Err(errno) = bind(&ctx.working_directory, &ctx.working_mount) {
        fail(ctx, JailStage::Mount, errno);
    }
    if ctx.mount_proc {
        if let Err(errno) = mount(
            Some("proc"),
            &ctx.proc_mount,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            None::<&str>,
        ) {
            fail(ctx, JailStage::Mount, errno);
        }
    }

    if let Err(errno) = chroot(&ctx.chroot_directory) {
        fail(ctx, JailStage::Chroot, errno);
    }
    if let Err(errno) = chdir(Path::new(JAIL_WORKING_DIR)) {
        fail(ctx, JailStage::Workdir, errno);
    }

    if !ctx.redirect_before_chroot {
        if let Err(errno) = apply_redirections(ctx) {
            fail(ctx, JailStage::Redirect, errno);
        }
    }

    if let Some(limit) = ctx.process_limit {
        if let Err(errno) = setrlimit(Resource::RLIMIT_NPROC, limit, limit) {
            fail(ctx, JailStage::Rlimit, errno);
        }
    }

    if let Err(errno) = drop_privileges(ctx.uid, ctx.gid) {
        fail(ctx, JailStage::Credentials, errno);
    }

    // handshake: released only after the controller registered our pid
    if let Err(err) = sem.wait() {
        let errno = match err {
            Error::Semaphore(errno) => errno,
            _ => Errno::UnknownErrno,
        };
        fail(ctx, JailStage::Handshake, errno);
    }

    let errno = match execve(&ctx.exec, &ctx.argv, &ctx.envp) {
        Ok(infallible) => match infallible {},
        Err(errno) => errno,
    };
    fail(ctx, JailStage::Exec, errno)
}

fn apply_redirections(ctx: &JailContext) -> nix::Result<()> {
    for redirection in &ctx.redirections {
        redirection.apply()?;
    }
    Ok(())
}

fn bind(source: &Path, target: &Path) -> nix::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
}

fn drop_privileges(uid: Uid, gid: Gid) -> nix::Result<()> {
    setgroups(&[gid])?;
    setgid(gid)?;
    setuid(uid)?;
    Ok(())
}

/// Report the failed stage over the pipe and take the guest down. The
/// write is fire-and-forget; with the controller gone there is nobody
/// left to tell.
fn fail(ctx: &JailContext, stage: JailStage, errno: Errno) -> ! {
    let mut report = [0u8; 8];
    report[..4].copy_from_slice(&stage.as_raw().to_le_bytes());
    report[4..].copy_from_slice(&(errno as i32).to_le_bytes());
    unsafe {
        libc::write(
            ctx.report_fd,
            report.as_ptr() as *const libc::c_void,
            report.len(),
        );
        libc::_exit(SETUP_FAILED_EXIT);
    }
}
