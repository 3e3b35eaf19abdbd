use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use anyhow::{bail, Context};
use cgroups_rs::{cgroup_builder::CgroupBuilder, Cgroup, CgroupPid};
use tracing::warn;

use crate::poll::poll_until;

/// Most processes a game may have alive at once (server, two players and whatever they fork).
const MAX_PIDS: i64 = 256;

fn current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("could not launch 'id -u'")?;
    let id = std::str::from_utf8(&output.stdout).context("id is not a valid string")?;
    Ok(id.trim().to_string())
}

/// Delegated cgroup v2 subtree of the current user.
fn cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// A cgroup holding the processes of one game.
#[derive(Debug)]
pub(super) struct Container {
    cgroup: Cgroup,
}

impl Container {
    pub(super) fn create(name: &str) -> anyhow::Result<Container> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);

        let user_id = current_user_id().context("could not get user id")?;
        let group_name = format!(
            "ARENA_{}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            name.replace(|c: char| !c.is_ascii_alphanumeric(), "_")
        );
        let cgroup = CgroupBuilder::new(&cgroup_path(&user_id, &group_name))
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(MAX_PIDS))
            .done()
            .build(cgroups_rs::hierarchies::auto())
            .context("could not create cgroup")?;
        if !cgroup.v2() {
            let _ = cgroup.delete();
            bail!("cgroups v2 is not available");
        }
        Ok(Container { cgroup })
    }

    pub(super) fn add(&self, pid: u32) -> anyhow::Result<()> {
        self.cgroup
            .add_task_by_tgid(CgroupPid { pid: pid as u64 })
            .context("could not add process to cgroup")
    }

    pub(super) fn pids(&self) -> Vec<u32> {
        self.cgroup
            .procs()
            .iter()
            .map(|p| p.pid as u32)
            .collect()
    }

    pub(super) fn kill(&self) -> anyhow::Result<()> {
        if self.cgroup.procs().is_empty() {
            return Ok(());
        }
        self.cgroup.kill().context("could not kill cgroup")
    }

    pub(super) fn wait_empty(&self, max_duration: Duration) -> anyhow::Result<()> {
        let emptied = poll_until(Duration::from_millis(10), max_duration, || {
            self.cgroup.procs().is_empty().then_some(())
        });
        if !emptied.is_ready() {
            bail!("{} processes left after {max_duration:?}", self.cgroup.procs().len());
        }
        Ok(())
    }

    pub(super) fn delete(&self) {
        if let Err(e) = self.cgroup.delete() {
            warn!("failed to remove cgroup {}: {e}", self.cgroup.path());
        }
    }
}
