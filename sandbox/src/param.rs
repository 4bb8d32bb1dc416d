use std::path::PathBuf;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{error::Error, launcher, process::SandboxProcess};

/// Sentinel for "no limit" on [`SandboxParameter::memory_limit`] and
/// [`SandboxParameter::process_limit`].
pub const UNLIMITED: i64 = -1;

/// Mount point for the binary volume, relative to the chroot directory.
/// The guest sees it as `/sandbox/binary`.
pub const BINARY_MOUNT_POINT: &str = "sandbox/binary";
/// Mount point for the working volume, relative to the chroot directory.
/// The guest sees it as `/sandbox/working` and starts there.
pub const WORKING_MOUNT_POINT: &str = "sandbox/working";

/// Description of one sandbox invocation, consumed by
/// [`SandboxParameter::start`].
///
/// The chroot directory must not be writable by the sandbox user and must
/// already contain the two empty mount point directories
/// ([`BINARY_MOUNT_POINT`] and [`WORKING_MOUNT_POINT`]); `binary_directory`
/// and `working_directory` are bind mounted onto them. Input data copied
/// into the working directory should not be writable by the sandbox user or
/// the guest may overwrite it.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[serde(deny_unknown_fields)]
#[builder(setter(into))]
pub struct SandboxParameter {
    /// Memory limit in bytes, enforced through the cgroup. [`UNLIMITED`]
    /// for none. Time is not limited here; the accounting loop samples the
    /// same cgroup and kills on its own schedule.
    #[builder(default = "UNLIMITED")]
    pub memory_limit: i64,
    /// Maximum process count for the sandbox user, typically below 10.
    /// [`UNLIMITED`] for none. Enforced per user, not per invocation,
    /// which is why `user_name` must be exclusive to one running sandbox.
    #[builder(default = "UNLIMITED")]
    pub process_limit: i64,
    /// Redirect stdio before chrooting, resolving the targets in the
    /// controller's filesystem view. Debugging escape hatch: point stdio at
    /// a pty (`socat -d -d pty,raw,echo=0 -`) and run a shell in the jail.
    #[builder(default)]
    pub redirect_before_chroot: bool,
    /// Mount `/proc` inside the jail.
    #[builder(default)]
    pub mount_proc: bool,
    /// Directory the guest is chrooted into.
    pub chroot_directory: PathBuf,
    /// Bind mounted onto [`BINARY_MOUNT_POINT`]. Should not be writable.
    pub binary_directory: PathBuf,
    /// Bind mounted onto [`WORKING_MOUNT_POINT`] and chdired into before
    /// exec. Must be writable for the guest to produce output files.
    pub working_directory: PathBuf,
    /// Program to run, named in the jail's namespace after chroot: a binary
    /// on the binary mount such as `/sandbox/binary/a.out`, or an
    /// interpreter from the chroot filesystem such as `/usr/bin/python`.
    pub executable_path: String,
    /// Arguments passed verbatim to the guest image.
    #[builder(default)]
    pub executable_parameters: Vec<String>,
    /// `KEY=VALUE` strings passed verbatim to the guest image.
    #[builder(default)]
    pub environment_variables: Vec<String>,
    /// Standard input redirection; relative paths resolve against the
    /// working mount. `None` leaves the descriptor inherited.
    #[builder(setter(into, strip_option), default)]
    pub stdin_redirection: Option<PathBuf>,
    /// Standard output redirection, same resolution rules.
    #[builder(setter(into, strip_option), default)]
    pub stdout_redirection: Option<PathBuf>,
    /// Standard error redirection, same resolution rules.
    #[builder(setter(into, strip_option), default)]
    pub stderr_redirection: Option<PathBuf>,
    /// Unprivileged account the guest runs as. Use a distinctive user for
    /// each concurrently running sandbox; the process limit is per user.
    pub user_name: String,
    /// Resource accounting group for this invocation, unique across
    /// concurrently active sandboxes.
    pub cgroup_name: String,
}

impl SandboxParameter {
    /// Launch the guest described by this parameter.
    ///
    /// Returns as soon as the guest is forked, registered in its cgroup and
    /// released from the handshake; it does not wait for the guest to exec
    /// or terminate.
    pub fn start(&self) -> Result<SandboxProcess, Error> {
        launcher::start(self)
    }
}
