//! Isolation kernel for running untrusted submissions.
//!
//! The crate launches one guest process per invocation: the controller
//! forks, the guest side jails itself (bind mounts, chroot, rlimit,
//! privilege drop) and blocks on a process-shared semaphore until the
//! controller has registered it in its cgroup, then execs the target.
//! The caller later reaps the guest and receives a classified
//! [`process::ExecutionResult`].
//!
//! Time and memory accounting is not done here; an external loop samples
//! the cgroup this crate sets up and kills the guest's process group on
//! timeout or OOM.

pub mod cgroup;
pub mod error;
mod jail;
mod launcher;
pub mod param;
pub mod process;
pub mod semaphore;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::error::{Error, JailStage, LaunchError};
    pub use super::param::{
        SandboxParameter, SandboxParameterBuilder, BINARY_MOUNT_POINT, UNLIMITED,
        WORKING_MOUNT_POINT,
    };
    pub use super::process::{ExecutionResult, SandboxProcess};
    pub use super::semaphore::Semaphore;
}
