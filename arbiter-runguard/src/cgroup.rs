//! Cgroup v1 controller: one uniquely-named subtree per supervised run,
//! spanning the `memory`, `cpuacct`, `cpuset` and `pids` hierarchies.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CONTROLLERS: &[&str] = &["memory", "cpuacct", "cpuset", "pids"];

const KILL_POLL_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct CgroupLimits {
    /// Memory + swap ceiling in KiB.
    pub memory_limit_kib: Option<u64>,
    pub proc_limit: Option<u64>,
}

fn write_cgroup(dir: &Path, file: &str, content: impl fmt::Display) -> Result<()> {
    let path = dir.join(file);
    let mut file = File::create(&path)
        .with_context(|| format!("failed to open cgroup file: {}", path.display()))?;
    write!(file, "{}", content)
        .with_context(|| format!("failed to write cgroup file: {}", path.display()))?;
    Ok(())
}

fn read_cgroup<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let path = dir.join(file);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read cgroup file: {}", path.display()))?;
    Ok(content.trim_end().parse::<T>()?)
}

fn remove_cgroup_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove cgroup: {}", dir.display())),
    }
}

/// One per-run cgroup subtree. Creation is always paired with
/// destruction: if the supervisor leaves by an error path, `Drop` kills
/// the remaining processes and removes the directories.
pub struct Cgroup {
    root: PathBuf,
    name: String,
    destroyed: bool,
}

impl Cgroup {
    /// Creates `<root>/<controller>/<name>` for every controller and
    /// applies the limits.
    pub fn create(name: &str, limits: &CgroupLimits) -> Result<Self> {
        Self::create_at(PathBuf::from(CGROUP_ROOT), name, limits)
    }

    fn create_at(root: PathBuf, name: &str, limits: &CgroupLimits) -> Result<Self> {
        let cg = Self {
            root,
            name: name.to_owned(),
            destroyed: false,
        };

        for ctrl in CONTROLLERS {
            let dir = cg.controller_dir(ctrl);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create cgroup: {}", dir.display()))?;
        }

        if let Some(kib) = limits.memory_limit_kib {
            let bytes = kib * 1024;
            let memory = cg.controller_dir("memory");
            write_cgroup(&memory, "memory.limit_in_bytes", bytes)?;
            // memsw accounting is absent when the kernel boots without
            // swapaccount=1; the plain limit still applies then.
            if let Err(err) = write_cgroup(&memory, "memory.memsw.limit_in_bytes", bytes) {
                warn!("failed to set memsw limit: {:#}", err);
            }
        }

        if let Some(proc_limit) = limits.proc_limit {
            write_cgroup(&cg.controller_dir("pids"), "pids.max", proc_limit)?;
        }

        cg.clone_cpuset()?;

        debug!("created cgroup {}", cg.name);
        Ok(cg)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn controller_dir(&self, ctrl: &str) -> PathBuf {
        self.root.join(ctrl).join(self.name.trim_start_matches('/'))
    }

    /// A fresh cpuset is unusable until it has cpus and mems; copy both
    /// from the parent (falling back to the hierarchy root).
    fn clone_cpuset(&self) -> Result<()> {
        let dir = self.controller_dir("cpuset");
        for file in &["cpuset.cpus", "cpuset.mems"] {
            let mut value = String::new();
            if let Some(parent) = dir.parent() {
                value = fs::read_to_string(parent.join(file))
                    .map(|s| s.trim_end().to_owned())
                    .unwrap_or_default();
            }
            if value.is_empty() {
                value = fs::read_to_string(self.root.join("cpuset").join(file))
                    .map(|s| s.trim_end().to_owned())
                    .unwrap_or_default();
            }
            if !value.is_empty() {
                write_cgroup(&dir, file, &value)?;
            }
        }
        Ok(())
    }

    pub fn attach(&self, pid: Pid) -> Result<()> {
        self.write_tasks(pid.as_raw())
    }

    /// Attaches the calling process; pid 0 names the writer, which keeps
    /// this correct from inside a fresh pid namespace.
    pub fn attach_self(&self) -> Result<()> {
        self.write_tasks(0)
    }

    fn write_tasks(&self, pid: i32) -> Result<()> {
        for ctrl in CONTROLLERS {
            let path = self.controller_dir(ctrl).join("tasks");
            let mut file = OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open tasks file: {}", path.display()))?;
            write!(file, "{}", pid)
                .with_context(|| format!("failed to attach pid to {}", path.display()))?;
        }
        Ok(())
    }

    /// Peak memory + swap usage in bytes.
    pub fn read_memory_max(&self) -> Result<u64> {
        let dir = self.controller_dir("memory");
        read_cgroup(&dir, "memory.memsw.max_usage_in_bytes")
            .or_else(|_| read_cgroup(&dir, "memory.max_usage_in_bytes"))
    }

    /// Accumulated CPU time in nanoseconds.
    pub fn read_cpu_ns(&self) -> Result<u64> {
        read_cgroup(&self.controller_dir("cpuacct"), "cpuacct.usage")
    }

    /// Polling form of OOM detection: scans `memory.oom_control`.
    pub fn read_oom(&self) -> Result<bool> {
        let path = self.controller_dir("memory").join("memory.oom_control");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(parse_oom_control(&content))
    }

    /// Eventfd form of OOM detection; preferred where the kernel
    /// supports `cgroup.event_control`.
    pub fn oom_watch(&self) -> Result<OomWatch> {
        OomWatch::subscribe(&self.controller_dir("memory"))
    }

    fn tasks(&self) -> Result<Vec<Pid>> {
        let path = self.controller_dir("memory").join("tasks");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read tasks file: {}", path.display()))?;
        let mut pids = Vec::new();
        for line in content.lines() {
            if !line.is_empty() {
                let pid: i32 = line.parse().context("malformed pid in tasks file")?;
                pids.push(Pid::from_raw(pid));
            }
        }
        Ok(pids)
    }

    /// SIGKILLs every process in the subtree and waits until the tasks
    /// list drains. No child may outlive the supervised run: run time of
    /// the monitored process is the run time of the whole group.
    pub fn kill_all(&self) -> Result<()> {
        loop {
            let pids = self.tasks()?;
            if pids.is_empty() {
                return Ok(());
            }
            for pid in pids {
                match signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(nix::Error::Sys(nix::errno::Errno::ESRCH)) => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to kill pid {}", pid))
                    }
                }
            }
            thread::sleep(KILL_POLL_DELAY);
        }
    }

    /// Removes the controller directories. ENOENT is ignored, so calling
    /// this twice is a no-op the second time.
    pub fn destroy(&mut self) -> Result<()> {
        for ctrl in CONTROLLERS {
            remove_cgroup_dir(&self.controller_dir(ctrl))?;
        }
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(err) = self.kill_all() {
            warn!("failed to kill cgroup {}: {:#}", self.name, err);
        }
        for ctrl in CONTROLLERS {
            if let Err(err) = remove_cgroup_dir(&self.controller_dir(ctrl)) {
                warn!("failed to remove cgroup {}: {:#}", self.name, err);
            }
        }
    }
}

fn parse_oom_control(content: &str) -> bool {
    let mut tokens = content.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "oom_kill" {
            return tokens
                .next()
                .and_then(|n| n.parse::<u64>().ok())
                .map(|n| n > 0)
                .unwrap_or(false);
        }
    }
    false
}

pub struct OomWatch {
    efd: RawFd,
}

impl OomWatch {
    fn subscribe(memory_dir: &Path) -> Result<Self> {
        use nix::fcntl::{open, OFlag};
        use nix::sys::stat::Mode;

        let efd = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .context("failed to create eventfd")?;
        let watch = Self { efd };

        let ofd = open(
            &memory_dir.join("memory.oom_control"),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .context("failed to open memory.oom_control")?;

        let result = (|| -> Result<()> {
            let cfd = open(
                &memory_dir.join("cgroup.event_control"),
                OFlag::O_WRONLY,
                Mode::empty(),
            )
            .context("failed to open cgroup.event_control")?;
            let registration = format!("{} {}", efd, ofd);
            let ret = unistd::write(cfd, registration.as_bytes());
            let _ = unistd::close(cfd);
            ret.context("failed to write cgroup.event_control")?;
            Ok(())
        })();

        let _ = unistd::close(ofd);
        result?;
        Ok(watch)
    }

    /// True once the kernel has counted an OOM kill in the group.
    pub fn triggered(&self) -> bool {
        let mut buf = [0u8; 8];
        matches!(unistd::read(self.efd, &mut buf), Ok(8))
    }
}

impl Drop for OomWatch {
    fn drop(&mut self) {
        let _ = unistd::close(self.efd);
    }
}
