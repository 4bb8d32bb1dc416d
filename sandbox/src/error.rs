use std::{ffi::NulError, fmt::Display, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to map shared memory for semaphore: {0}")]
    ResourceExhausted(Errno),
    #[error("unable to initialize semaphore counter: {0}")]
    InitializationFailed(Errno),
    #[error("semaphore operation failed: {0}")]
    Semaphore(Errno),
    #[error("sandbox launch failed: {0}")]
    LaunchFailed(#[from] LaunchError),
    #[error("guest failed to execute target image: {0}")]
    ExecFailed(Errno),
    #[error("unable to wait for guest process: {0}")]
    WaitFailed(Errno),
}

/// Reasons a launch cannot produce a usable guest.
///
/// Everything up to `Fork` is detected before the controller forks and is
/// returned synchronously from `start`. `Guest` carries a failure the guest
/// side reported over the inherited pipe; it surfaces at reap time because
/// the guest has no return channel after fork.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("`{0}` is not an accessible directory")]
    NotADirectory(PathBuf),
    #[error("jail is missing mount point `{0}`")]
    MissingMountPoint(PathBuf),
    #[error("nul byte in executable path, argument or environment")]
    NulByte(#[from] NulError),
    #[error("no such user: `{0}`")]
    UnknownUser(String),
    #[error("unable to create report pipe: {0}")]
    Pipe(Errno),
    #[error("unable to fork controller: {0}")]
    Fork(Errno),
    #[error("unable to register guest in cgroup: {0}")]
    ControlGroup(#[from] cgroups_rs::error::Error),
    #[error("guest setup failed while {stage}: {errno}")]
    Guest { stage: JailStage, errno: Errno },
}

/// Jail setup step the guest was in when it failed.
///
/// Encoded into the report the guest writes before self-terminating, so the
/// controller can tell a botched mount from a botched exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailStage {
    Redirect,
    Namespace,
    Mount,
    Chroot,
    Workdir,
    Rlimit,
    Credentials,
    Handshake,
    Exec,
}

impl JailStage {
    pub(crate) fn as_raw(self) -> u32 {
        match self {
            JailStage::Redirect => 0,
            JailStage::Namespace => 1,
            JailStage::Mount => 2,
            JailStage::Chroot => 3,
            JailStage::Workdir => 4,
            JailStage::Rlimit => 5,
            JailStage::Credentials => 6,
            JailStage::Handshake => 7,
            JailStage::Exec => 8,
        }
    }
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => JailStage::Redirect,
            1 => JailStage::Namespace,
            2 => JailStage::Mount,
            3 => JailStage::Chroot,
            4 => JailStage::Workdir,
            5 => JailStage::Rlimit,
            6 => JailStage::Credentials,
            7 => JailStage::Handshake,
            8 => JailStage::Exec,
            _ => return None,
        })
    }
}

impl Display for JailStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                JailStage::Redirect => "redirecting stdio",
                JailStage::Namespace => "unsharing mount namespace",
                JailStage::Mount => "mounting jail volumes",
                JailStage::Chroot => "entering chroot",
                JailStage::Workdir => "changing to working mount",
                JailStage::Rlimit => "applying process limit",
                JailStage::Credentials => "dropping privileges",
                JailStage::Handshake => "waiting for cgroup registration",
                JailStage::Exec => "replacing process image",
            }
        )
    }
}
