//! Controller-side half of the launcher.
//!
//! Everything that can fail synchronously fails here, before the fork:
//! directory and mount point resolution, user lookup, C string conversion,
//! pipe and semaphore setup. After the fork the controller's only jobs are
//! cgroup registration and the handshake post; the guest side lives in
//! [`crate::jail`].

use std::{
    ffi::CString,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::Path,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::{fork, setpgid, ForkResult, Pid, User},
};

use crate::{
    cgroup::CgroupWrapper,
    error::{Error, LaunchError},
    jail::{self, JailContext, Redirection},
    param::{SandboxParameter, BINARY_MOUNT_POINT, UNLIMITED, WORKING_MOUNT_POINT},
    process::{ChildHandle, SandboxProcess},
    semaphore::Semaphore,
};

pub(crate) fn start(param: &SandboxParameter) -> Result<SandboxProcess, Error> {
    let ctx = resolve(param)?;

    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(LaunchError::Pipe(Errno::last()).into());
    }
    let (report_rx, report_tx) = unsafe {
        (
            OwnedFd::from_raw_fd(fds[0]),
            OwnedFd::from_raw_fd(fds[1]),
        )
    };

    // shared with exactly one forked guest; owned and torn down here
    let sem = Semaphore::new(true, 0)?;

    let ctx = JailContext {
        report_fd: report_tx.as_raw_fd(),
        ..ctx
    };

    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => jail::enter(&ctx, &sem),
        ForkResult::Parent { child } => {
            drop(report_tx);
            // mirror the guest's setpgid, so a group kill can never hit
            // the controller's own group during the early window
            let _ = setpgid(child, child);
            log::trace!("forked guest {} for cgroup `{}`", child, param.cgroup_name);

            let registered = CgroupWrapper::create(&param.cgroup_name, param.memory_limit)
                .and_then(|cgroup| {
                    cgroup.attach(child)?;
                    Ok(cgroup)
                });
            let cgroup = match registered {
                Ok(cgroup) => cgroup,
                Err(err) => {
                    abort_guest(child);
                    return Err(LaunchError::ControlGroup(err).into());
                }
            };

            // the guest is blocked until this post; registration above is
            // therefore visible before any guest instruction runs
            if let Err(err) = sem.post() {
                abort_guest(child);
                let _ = cgroup.delete();
                return Err(err);
            }
            log::trace!("guest {} registered and released", child);

            Ok(SandboxProcess::new(
                ChildHandle::new(child, report_rx),
                cgroup,
            ))
        }
    }
}

/// Resolve everything the guest will need while errors can still be
/// returned to the caller. The report fd is patched in after the pipe
/// exists.
fn resolve(param: &SandboxParameter) -> Result<JailContext, Error> {
    for dir in [
        &param.chroot_directory,
        &param.binary_directory,
        &param.working_directory,
    ] {
        if !dir.is_dir() {
            return Err(LaunchError::NotADirectory(dir.clone()).into());
        }
    }

    let binary_mount = param.chroot_directory.join(BINARY_MOUNT_POINT);
    let working_mount = param.chroot_directory.join(WORKING_MOUNT_POINT);
    for mount in [&binary_mount, &working_mount] {
        if !mount.is_dir() {
            return Err(LaunchError::MissingMountPoint(mount.clone()).into());
        }
    }

    let exec = cstring(&param.executable_path)?;
    let mut argv = Vec::with_capacity(param.executable_parameters.len() + 1);
    argv.push(exec.clone());
    for arg in &param.executable_parameters {
        argv.push(cstring(arg)?);
    }
    let mut envp = Vec::with_capacity(param.environment_variables.len());
    for var in &param.environment_variables {
        envp.push(cstring(var)?);
    }

    let mut redirections = Vec::new();
    if let Some(path) = &param.stdin_redirection {
        redirections.push(Redirection::input(cstring_path(path)?));
    }
    if let Some(path) = &param.stdout_redirection {
        redirections.push(Redirection::output(cstring_path(path)?, libc::STDOUT_FILENO));
    }
    if let Some(path) = &param.stderr_redirection {
        redirections.push(Redirection::output(cstring_path(path)?, libc::STDERR_FILENO));
    }

    let user = User::from_name(&param.user_name)
        .ok()
        .flatten()
        .ok_or_else(|| LaunchError::UnknownUser(param.user_name.clone()))?;

    let process_limit = match param.process_limit == UNLIMITED {
        true => None,
        false => Some(param.process_limit as u64),
    };

    Ok(JailContext {
        exec,
        argv,
        envp,
        chroot_directory: param.chroot_directory.clone(),
        binary_directory: param.binary_directory.clone(),
        working_directory: param.working_directory.clone(),
        proc_mount: param.chroot_directory.join("proc"),
        binary_mount,
        working_mount,
        mount_proc: param.mount_proc,
        redirect_before_chroot: param.redirect_before_chroot,
        redirections,
        process_limit,
        uid: user.uid,
        gid: user.gid,
        report_fd: -1,
    })
}

/// A guest that must not run: kill it before the handshake releases it and
/// collect the corpse so nothing leaks.
fn abort_guest(child: Pid) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
}

fn cstring(text: &str) -> Result<CString, LaunchError> {
    CString::new(text).map_err(LaunchError::from)
}

fn cstring_path(path: &Path) -> Result<CString, LaunchError> {
    CString::new(path.as_os_str().as_bytes()).map_err(LaunchError::from)
}

#[cfg(test)]
mod test {
    use crate::prelude::*;

    fn jail_skeleton() -> tempfile::TempDir {
        let chroot = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(chroot.path().join(BINARY_MOUNT_POINT)).unwrap();
        std::fs::create_dir_all(chroot.path().join(WORKING_MOUNT_POINT)).unwrap();
        chroot
    }

    #[test]
    fn rejects_missing_chroot() {
        let volume = tempfile::tempdir().unwrap();
        let err = SandboxParameterBuilder::default()
            .chroot_directory("/nonexistent/jail")
            .binary_directory(volume.path())
            .working_directory(volume.path())
            .executable_path("/sandbox/binary/a.out")
            .user_name("nobody")
            .cgroup_name("sandbox.test.chroot")
            .build()
            .unwrap()
            .start()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LaunchFailed(LaunchError::NotADirectory(_))
        ));
    }

    #[test]
    /// the jail must pre-contain its two empty mount point directories
    fn rejects_missing_mount_points() {
        let chroot = tempfile::tempdir().unwrap();
        let volume = tempfile::tempdir().unwrap();
        let err = SandboxParameterBuilder::default()
            .chroot_directory(chroot.path())
            .binary_directory(volume.path())
            .working_directory(volume.path())
            .executable_path("/sandbox/binary/a.out")
            .user_name("nobody")
            .cgroup_name("sandbox.test.mount")
            .build()
            .unwrap()
            .start()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LaunchFailed(LaunchError::MissingMountPoint(_))
        ));
    }

    #[test]
    fn rejects_nul_in_arguments() {
        let chroot = jail_skeleton();
        let volume = tempfile::tempdir().unwrap();
        let err = SandboxParameterBuilder::default()
            .chroot_directory(chroot.path())
            .binary_directory(volume.path())
            .working_directory(volume.path())
            .executable_path("/sandbox/binary/a.out")
            .executable_parameters(vec!["bad\0arg".to_owned()])
            .user_name("nobody")
            .cgroup_name("sandbox.test.nul")
            .build()
            .unwrap()
            .start()
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed(LaunchError::NulByte(_))));
    }

    #[test]
    fn rejects_unknown_user() {
        let chroot = jail_skeleton();
        let volume = tempfile::tempdir().unwrap();
        let err = SandboxParameterBuilder::default()
            .chroot_directory(chroot.path())
            .binary_directory(volume.path())
            .working_directory(volume.path())
            .executable_path("/sandbox/binary/a.out")
            .user_name("sandbox-test-no-such-user")
            .cgroup_name("sandbox.test.user")
            .build()
            .unwrap()
            .start()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LaunchFailed(LaunchError::UnknownUser(_))
        ));
    }
}
