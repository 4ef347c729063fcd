//! Video sidecar process supervision
//!
//! The video streamer runs as an independent OS process. The agent only
//! starts it when a session opens and kills it, together with everything it
//! spawned, when the session is torn down. Nothing is exchanged with it
//! in-process and its health is not watched between those two points.
//!
//! Descendant enumeration goes through [`ProcessTable`] so the kill order can
//! be checked against a fake process tree.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use sysinfo::{Pid, ProcessStatus, Signal, System};

/// View of the OS process table
pub trait ProcessTable: Send {
    /// Re-read the table. Queries below answer from the last refresh.
    fn refresh(&mut self);

    /// Direct children of `pid`
    fn children(&self, pid: u32) -> Vec<u32>;

    /// Present and not a zombie
    fn is_alive(&self, pid: u32) -> bool;

    /// Send SIGKILL. Returns false when the process was already gone.
    fn kill(&mut self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by `sysinfo`
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn refresh(&mut self) {
        self.system.refresh_processes();
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let parent = Pid::from_u32(pid);
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(parent))
            .map(|(child, _)| child.as_u32())
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn kill(&mut self, pid: u32) -> bool {
        match self.system.process(Pid::from_u32(pid)) {
            Some(process) => process
                .kill_with(Signal::Kill)
                .unwrap_or_else(|| process.kill()),
            None => false,
        }
    }
}

/// How to launch the sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarCommand {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl SidecarCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.envs.push((key.into(), value.to_string()));
        self
    }

    /// Video streamer command line for the agent installed in `app_dir`.
    ///
    /// Returns `None` when video is disabled in the config.
    pub fn video_streamer(config: &AgentConfig, app_dir: &Path) -> Option<Self> {
        let video = &config.video;
        if !video.enabled {
            return None;
        }

        let mut command = Self::new(&video.program)
            .arg(app_dir.join(&video.script).to_string_lossy())
            .arg("--d")
            .arg(app_dir.to_string_lossy())
            .env("SETU_UNIT_ID", &config.unit.id)
            .env("SETU_CLOUD_HOST", &config.cloud.host)
            .env("SETU_VIDEO_PORT", config.cloud.video_port)
            .env("SETU_VIDEO_GRAYSCALE", video.grayscale)
            .env("SETU_VIDEO_FPS", video.fps)
            .env("SETU_VIDEO_QUALITY", video.quality)
            .env("SETU_VIDEO_WIDTH", video.width)
            .env("SETU_VIDEO_HEIGHT", video.height);
        command.current_dir = Some(app_dir.to_path_buf());
        Some(command)
    }
}

/// A spawned sidecar. Owned by exactly one session.
#[derive(Debug)]
pub struct SidecarHandle {
    pid: u32,
    child: Option<Child>,
    terminated: bool,
}

impl SidecarHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Spawns the sidecar and kills its whole process tree on request
pub struct ProcessSupervisor<T: ProcessTable = SystemProcessTable> {
    table: T,
    own_pid: u32,
}

impl ProcessSupervisor<SystemProcessTable> {
    pub fn new() -> Self {
        Self::with_table(SystemProcessTable::new())
    }
}

impl Default for ProcessSupervisor<SystemProcessTable> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ProcessTable> ProcessSupervisor<T> {
    pub fn with_table(table: T) -> Self {
        Self {
            table,
            own_pid: std::process::id(),
        }
    }

    /// Launch `command` as a child process.
    pub fn spawn(&mut self, command: &SidecarCommand) -> Result<SidecarHandle> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null());
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {}", command.program, e)))?;
        let pid = child.id();
        info!("Sidecar started: {} (pid {})", command.program, pid);

        Ok(SidecarHandle {
            pid,
            child: Some(child),
            terminated: false,
        })
    }

    /// All live descendants of `pid`, deepest first.
    pub fn descendants(&mut self, pid: u32) -> Vec<u32> {
        self.table.refresh();
        self.collect_descendants(pid)
    }

    /// True if `pid` is running according to a fresh table read.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        self.table.refresh();
        self.table.is_alive(pid)
    }

    /// Force-kill every descendant of the sidecar, then the sidecar itself,
    /// and reap it. Returns how many processes were signalled.
    ///
    /// Calling this on a handle that is already terminated, or whose process
    /// already exited, is a no-op.
    pub fn terminate(&mut self, handle: &mut SidecarHandle) -> Result<usize> {
        if handle.terminated {
            return Ok(0);
        }

        self.table.refresh();
        let mut killed = 0;
        if self.table.is_alive(handle.pid) {
            for pid in self.collect_descendants(handle.pid) {
                if pid == self.own_pid {
                    continue;
                }
                if self.table.kill(pid) {
                    debug!("Killed sidecar descendant {}", pid);
                    killed += 1;
                }
            }
            if self.table.kill(handle.pid) {
                killed += 1;
            }
        } else {
            debug!("Sidecar {} already exited", handle.pid);
        }

        handle.terminated = true;

        if let Some(mut child) = handle.child.take() {
            // Covers platforms where the table could not deliver the signal
            if let Err(e) = child.kill() {
                debug!("Sidecar {} kill fallback: {}", handle.pid, e);
            }
            match child.wait() {
                Ok(status) => debug!("Sidecar {} reaped ({})", handle.pid, status),
                Err(e) => {
                    warn!("Failed to reap sidecar {}: {}", handle.pid, e);
                    return Err(Error::Process(format!(
                        "failed to reap sidecar {}: {}",
                        handle.pid, e
                    )));
                }
            }
        }

        info!(
            "Sidecar {} terminated ({} processes killed)",
            handle.pid, killed
        );
        Ok(killed)
    }

    /// Post-order walk from the last refresh. Guards against pid cycles.
    fn collect_descendants(&self, root: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([root]);
        self.walk(root, &mut seen, &mut out);
        out
    }

    fn walk(&self, pid: u32, seen: &mut HashSet<u32>, out: &mut Vec<u32>) {
        for child in self.table.children(pid) {
            if !seen.insert(child) || !self.table.is_alive(child) {
                continue;
            }
            self.walk(child, seen, out);
            out.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory process tree
    #[derive(Default)]
    struct FakeTable {
        /// pid -> (parent, alive)
        procs: HashMap<u32, (u32, bool)>,
        kills: Vec<u32>,
    }

    impl FakeTable {
        fn with(tree: &[(u32, u32)]) -> Self {
            let mut table = Self::default();
            for &(pid, parent) in tree {
                table.procs.insert(pid, (parent, true));
            }
            table
        }
    }

    impl ProcessTable for FakeTable {
        fn refresh(&mut self) {}

        fn children(&self, pid: u32) -> Vec<u32> {
            let mut kids: Vec<u32> = self
                .procs
                .iter()
                .filter(|(_, (parent, _))| *parent == pid)
                .map(|(child, _)| *child)
                .collect();
            kids.sort_unstable();
            kids
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.procs.get(&pid).is_some_and(|(_, alive)| *alive)
        }

        fn kill(&mut self, pid: u32) -> bool {
            match self.procs.get_mut(&pid) {
                Some((_, alive)) if *alive => {
                    *alive = false;
                    self.kills.push(pid);
                    true
                }
                _ => false,
            }
        }
    }

    /// Supervisor whose own pid cannot collide with the fake tree
    fn fake_supervisor(table: FakeTable) -> ProcessSupervisor<FakeTable> {
        let mut supervisor = ProcessSupervisor::with_table(table);
        supervisor.own_pid = 0;
        supervisor
    }

    fn handle(pid: u32) -> SidecarHandle {
        SidecarHandle {
            pid,
            child: None,
            terminated: false,
        }
    }

    #[test]
    fn test_kills_descendants_before_root() {
        // 100 ── 101 ── 103
        //    └── 102
        // 200 (unrelated)
        let table = FakeTable::with(&[(100, 1), (101, 100), (102, 100), (103, 101), (200, 1)]);
        let mut supervisor = fake_supervisor(table);

        let killed = supervisor.terminate(&mut handle(100)).unwrap();

        assert_eq!(killed, 4);
        assert_eq!(supervisor.table.kills, vec![103, 101, 102, 100]);
        assert!(supervisor.table.is_alive(200));
        for pid in [100, 101, 102, 103] {
            assert!(!supervisor.table.is_alive(pid));
        }
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let table = FakeTable::with(&[(100, 1), (101, 100)]);
        let mut supervisor = fake_supervisor(table);
        let mut h = handle(100);

        assert_eq!(supervisor.terminate(&mut h).unwrap(), 2);
        assert!(h.is_terminated());
        assert_eq!(supervisor.terminate(&mut h).unwrap(), 0);
        assert_eq!(supervisor.table.kills, vec![101, 100]);
    }

    #[test]
    fn test_dead_root_is_noop() {
        let mut table = FakeTable::with(&[(100, 1)]);
        table.procs.insert(100, (1, false));
        let mut supervisor = fake_supervisor(table);

        assert_eq!(supervisor.terminate(&mut handle(100)).unwrap(), 0);
        assert!(supervisor.table.kills.is_empty());
    }

    #[test]
    fn test_never_kills_own_pid() {
        let table = FakeTable::with(&[(100, 1), (101, 100), (102, 101)]);
        let mut supervisor = fake_supervisor(table);
        supervisor.own_pid = 101;

        supervisor.terminate(&mut handle(100)).unwrap();
        assert_eq!(supervisor.table.kills, vec![102, 100]);
        assert!(supervisor.table.is_alive(101));
    }

    #[test]
    fn test_skips_dead_branches_and_cycles() {
        let mut table = FakeTable::with(&[(100, 1), (101, 100), (102, 101)]);
        table.procs.insert(101, (100, false));
        // A pid claiming the root as both child and parent
        table.procs.insert(1, (100, true));
        let mut supervisor = fake_supervisor(table);

        assert_eq!(supervisor.descendants(100), vec![1]);
    }

    #[test]
    fn test_video_streamer_command() {
        let config = AgentConfig::from_toml(
            r#"
[unit]
id = "drone-9"

[cloud]
host = "10.0.0.5"
video_port = 7000

[video]
fps = 24
"#,
        )
        .unwrap();
        let dir = Path::new("/opt/setu");

        let command = SidecarCommand::video_streamer(&config, dir).unwrap();
        assert_eq!(command.program, "/usr/bin/python3");
        assert_eq!(
            command.args,
            vec!["/opt/setu/video_streamer.py", "--d", "/opt/setu"]
        );
        assert!(command.envs.contains(&("SETU_VIDEO_PORT".into(), "7000".into())));
        assert!(command.envs.contains(&("SETU_VIDEO_FPS".into(), "24".into())));
        assert!(command.envs.contains(&("SETU_UNIT_ID".into(), "drone-9".into())));
        assert_eq!(command.current_dir.as_deref(), Some(dir));

        let mut disabled = config.clone();
        disabled.video.enabled = false;
        assert!(SidecarCommand::video_streamer(&disabled, dir).is_none());
    }

    #[test]
    fn test_spawn_failure_is_process_error() {
        let mut supervisor = ProcessSupervisor::new();
        let err = supervisor
            .spawn(&SidecarCommand::new("/nonexistent/setu-video"))
            .unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }
}
