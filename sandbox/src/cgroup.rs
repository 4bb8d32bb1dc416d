use cgroups_rs::{
    cgroup_builder::CgroupBuilder, hierarchies, memory::MemController, Cgroup, CgroupPid,
};
use nix::unistd::Pid;

use crate::param::UNLIMITED;

type Result<T> = std::result::Result<T, cgroups_rs::error::Error>;

lazy_static::lazy_static! {
    /// probed once against the mounted hierarchy
    pub static ref CGROUP_V2: bool = {
        let v2 = hierarchies::auto().v2();
        match v2 {
            true => log::info!("using cgroup v2"),
            false => log::info!("using cgroup v1"),
        }
        v2
    };
}

/// Owned accounting group of one sandbox invocation.
///
/// The launcher creates the group (with its memory ceiling) and attaches
/// the guest pid before the guest is released from the handshake, so every
/// descendant the guest ever spawns is accounted from its first
/// instruction. The external accounting loop samples the same group by
/// name at its own cadence.
#[derive(Debug)]
pub struct CgroupWrapper {
    inner: Cgroup,
    name: String,
}

impl CgroupWrapper {
    /// Create (or reopen) the group and apply the memory hard limit when
    /// one is requested.
    pub(crate) fn create(name: &str, memory_limit: i64) -> Result<Self> {
        let builder = CgroupBuilder::new(name);
        let builder = match memory_limit == UNLIMITED {
            true => builder,
            false => builder.memory().memory_hard_limit(memory_limit).done(),
        };
        let inner = builder.build(hierarchies::auto())?;

        Ok(Self {
            inner,
            name: name.to_owned(),
        })
    }

    /// Put `pid` on the group's task list.
    pub(crate) fn attach(&self, pid: Pid) -> Result<()> {
        let pid = CgroupPid::from(pid.as_raw() as u64);
        match *CGROUP_V2 {
            true => self.inner.add_task_by_tgid(pid),
            false => self.inner.add_task(pid),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pids currently attached to the group.
    pub fn tasks(&self) -> Vec<u64> {
        self.inner.tasks().into_iter().map(|pid| pid.pid).collect()
    }

    /// Current memory charge in bytes, the value the accounting loop
    /// compares against the limit.
    pub fn memory_usage(&self) -> u64 {
        let controller: &MemController = self.inner.controller_of().unwrap();
        controller.memory_stat().usage_in_bytes
    }

    /// High-water memory charge in bytes.
    pub fn memory_max_usage(&self) -> u64 {
        let controller: &MemController = self.inner.controller_of().unwrap();
        controller.memory_stat().max_usage_in_bytes
    }

    /// Remove the group. Callers treat failure as non-fatal; a group with
    /// live tasks cannot be deleted.
    pub(crate) fn delete(&self) -> Result<()> {
        self.inner.delete()
    }
}
