//! Supervision of the processes of one game.
//!
//! A [`ProcessGroup`] owns the server and player processes it spawned. On Linux, when
//! containment is enabled, every member is also placed in a dedicated cgroup so that
//! whatever they fork can be killed as a unit. Without a cgroup, descendants are found by
//! walking the process table from the members' pids. On Unix each member also leads its
//! own OS process group, which keeps track of children that outlived their parent and
//! were reparented away from the member.
//!
//! Nothing is ever killed by name or command line: only processes that descend from a
//! member of the group, or share its process group, are touched.

#[cfg(target_os = "linux")]
mod cgroup_linux;
#[cfg(target_os = "linux")]
use cgroup_linux::Container;

#[cfg(not(target_os = "linux"))]
mod cgroup_stub;
#[cfg(not(target_os = "linux"))]
use cgroup_stub::Container;

use std::{
    collections::HashSet,
    process::{Child, Command, ExitStatus},
    time::Duration,
};

use anyhow::{bail, Context};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, trace, warn};

use crate::{configuration::Configuration, poll::poll_until};

const REAP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Member {
    label: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl Member {
    fn is_running(&mut self) -> bool {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => {
                    warn!("could not query {} ({}): {e}", self.label, self.child.id());
                }
            }
        }
        self.status.is_none()
    }
}

/// Handle on a member of a [`ProcessGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberId(usize);

#[derive(Debug)]
pub struct ProcessGroup {
    name: String,
    members: Vec<Member>,
    container: Option<Container>,
    cleaned_up: bool,
}

impl ProcessGroup {
    /// Creates an empty group. With `contain_processes`, a cgroup named after `name` is
    /// created; if that fails the group runs uncontained when `allow_uncontained` is set.
    ///
    /// # Errors
    /// Fails when a cgroup is required but cannot be created.
    pub fn new(name: &str, config: &Configuration) -> anyhow::Result<ProcessGroup> {
        let container = if config.contain_processes {
            match Container::create(name) {
                Ok(container) => Some(container),
                Err(e) if config.allow_uncontained => {
                    warn!("running '{name}' uncontained: {e:#}");
                    None
                }
                Err(e) => {
                    return Err(e).context(
                        "could not contain processes (set ARENA_ALLOW_UNCONTAINED=true to run without cgroups)",
                    )
                }
            }
        } else {
            None
        };

        Ok(ProcessGroup {
            name: name.to_string(),
            members: vec![],
            container,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        self.container.is_some()
    }

    /// Spawns `command` as a member of the group.
    ///
    /// # Errors
    /// Fails when the command cannot be spawned or cannot be moved into the cgroup. In the
    /// latter case the process has already been killed.
    pub fn spawn(&mut self, label: &str, command: &mut Command) -> anyhow::Result<MemberId> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("could not launch {label} ({command:?})"))?;
        let pid = child.id();

        if let Some(container) = &self.container {
            if let Err(e) = container.add(pid) {
                let kill = child.kill();
                let _ = child.wait();
                return Err(e).with_context(|| match kill {
                    Ok(()) => format!("could not add {label} to cgroup"),
                    Err(err) => format!(
                        "could not add {label} to cgroup, and it could not be killed either ({err})"
                    ),
                });
            }
        }

        debug!("{}: launched {label} as pid {pid}", self.name);
        self.members.push(Member {
            label: label.to_string(),
            child,
            status: None,
        });
        self.cleaned_up = false;
        Ok(MemberId(self.members.len() - 1))
    }

    pub fn is_running(&mut self, id: MemberId) -> bool {
        self.members.get_mut(id.0).is_some_and(Member::is_running)
    }

    pub fn exit_status(&mut self, id: MemberId) -> Option<ExitStatus> {
        let member = self.members.get_mut(id.0)?;
        member.is_running();
        member.status
    }

    pub fn pid(&self, id: MemberId) -> Option<u32> {
        self.members.get(id.0).map(|m| m.child.id())
    }

    /// Stops every member and everything they spawned.
    ///
    /// Members and their descendants first get SIGTERM and up to `terminate_wait` to exit,
    /// then SIGKILL and up to `kill_wait`. Returns the processes that survived both, as
    /// `"label (pid)"` descriptions.
    pub fn shutdown(&mut self, terminate_wait: Duration, kill_wait: Duration) -> Vec<String> {
        let mut sys = System::new();

        let descendants = self.descendants(&mut sys);
        trace!(name = %self.name, ?descendants, "terminating");
        for member in self.members.iter_mut().filter(|m| m.status.is_none()) {
            signal(&sys, member.child.id(), Signal::Term);
        }
        for &pid in &descendants {
            signal(&sys, pid, Signal::Term);
        }

        let exited = poll_until(REAP_POLL, terminate_wait, || {
            self.members
                .iter_mut()
                .all(|m| !m.is_running())
                .then_some(())
        });

        if !exited.is_ready() {
            debug!("{}: members still running after SIGTERM, killing", self.name);
        }
        // Strays are killed even when the members exited on their own.
        if let Some(container) = &self.container {
            if let Err(e) = container.kill() {
                warn!("{}: could not kill cgroup: {e:#}", self.name);
            }
        }
        let descendants = descendants
            .union(&self.descendants(&mut sys))
            .copied()
            .collect::<HashSet<_>>();
        for member in self.members.iter_mut() {
            if member.is_running() {
                if let Err(e) = member.child.kill() {
                    warn!("could not kill {} ({}): {e}", member.label, member.child.id());
                }
            }
        }
        sys.refresh_processes(ProcessesToUpdate::All, true);
        for &pid in &descendants {
            signal(&sys, pid, Signal::Kill);
        }

        poll_until(REAP_POLL, kill_wait, || {
            let members_done = self.members.iter_mut().all(|m| !m.is_running());
            sys.refresh_processes(ProcessesToUpdate::All, true);
            (members_done && !descendants.iter().any(|&pid| is_alive(&sys, pid))).then_some(())
        });

        let mut survivors = vec![];
        for member in self.members.iter_mut() {
            if member.is_running() {
                survivors.push(format!("{} ({})", member.label, member.child.id()));
            }
        }
        sys.refresh_processes(ProcessesToUpdate::All, true);
        for &pid in &descendants {
            if is_alive(&sys, pid) {
                survivors.push(format!("descendant ({pid})"));
            }
        }

        if let Some(container) = &self.container {
            if let Err(e) = container.wait_empty(kill_wait) {
                survivors.push(format!("cgroup not empty: {e:#}"));
            }
            container.delete();
        }

        if survivors.is_empty() {
            self.cleaned_up = true;
        } else {
            warn!("{}: processes survived teardown: {survivors:?}", self.name);
        }
        survivors
    }

    /// Pids of the processes spawned, directly or not, by a member, plus whatever is left
    /// in the members' process groups.
    fn descendants(&mut self, sys: &mut System) -> HashSet<u32> {
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut found = HashSet::new();
        if let Some(container) = &self.container {
            found.extend(container.pids());
        }
        let mut frontier = self
            .members
            .iter()
            .map(|m| Pid::from_u32(m.child.id()))
            .collect::<Vec<_>>();
        while let Some(parent) = frontier.pop() {
            for (pid, process) in sys.processes() {
                if process.parent() == Some(parent) && found.insert(pid.as_u32()) {
                    frontier.push(*pid);
                }
            }
        }

        let leaders = self.members.iter().map(|m| m.child.id()).collect::<HashSet<_>>();
        for pid in sys.processes().keys() {
            if process_group_of(pid.as_u32()).is_some_and(|group| leaders.contains(&group)) {
                found.insert(pid.as_u32());
            }
        }

        for leader in &leaders {
            found.remove(leader);
        }
        found
    }
}

fn signal(sys: &System, pid: u32, signal: Signal) {
    if let Some(process) = sys.process(Pid::from_u32(pid)) {
        if process.kill_with(signal) != Some(true) {
            trace!("could not send {signal:?} to {pid}");
        }
    }
}

/// Process group id, the fifth field of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn process_group_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // the command name is parenthesized and may itself contain spaces or parentheses
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(2)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_group_of(_pid: u32) -> Option<u32> {
    None
}

fn is_alive(sys: &System, pid: u32) -> bool {
    sys.process(Pid::from_u32(pid))
        .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up && !self.members.is_empty() {
            let survivors = self.shutdown(CLEANUP_DURATION, CLEANUP_DURATION);
            if !survivors.is_empty() {
                warn!("{}: could not clean up on drop: {survivors:?}", self.name);
            }
        }
    }
}

/// Fails unless the platform can contain processes at all. Used to report early, before
/// the first game, instead of failing every single game.
pub fn check_containment(config: &Configuration) -> anyhow::Result<()> {
    if !config.contain_processes || config.allow_uncontained {
        return Ok(());
    }
    if let Err(e) = Container::create("arena_containment_check").map(|c| c.delete()) {
        bail!("process containment unavailable: {e:#}");
    }
    Ok(())
}
