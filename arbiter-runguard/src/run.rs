//! The supervisor: composes cgroup, namespaces, rlimits and (optionally)
//! the seccomp filter around one fork+exec of the target command.

use crate::cgroup::{Cgroup, CgroupLimits};
use crate::meta::MetaFile;
use crate::seccomp::SeccompPolicy;
use crate::{child, parent, pipe, signal, RunguardOptions};

use std::fs;
use std::process::{self, Command};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{debug, error, info};
use nix::fcntl::{self, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{self, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult};

/// Runs the target under full isolation and returns the exit code to
/// propagate: the child's own code, or 128+signal if it was signaled.
pub fn run(opt: &RunguardOptions) -> Result<i32> {
    anyhow::ensure!(!opt.command.is_empty(), "no command specified");

    let mut meta = MetaFile::open(opt.metafile.as_deref())?;
    match supervise(opt, &mut meta) {
        Ok(code) => Ok(code),
        Err(err) => {
            meta.append("internal-error", format_args!("{:#}", err));
            Err(err)
        }
    }
}

fn supervise(opt: &RunguardOptions, meta: &mut MetaFile) -> Result<i32> {
    signal::block_sigchld()?;

    let filter = match opt.seccomp {
        Some(ref path) => Some(SeccompPolicy::from_file(path)?.compile()?),
        None => None,
    };

    let cgroup_name = match opt.cgroup {
        Some(ref name) => name.clone(),
        None => {
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("clock before epoch")?
                .as_secs();
            format!("/judger/cgroup_{}_{}", unistd::getpid(), epoch)
        }
    };

    info!("creating cgroup {}", cgroup_name);
    let limits = CgroupLimits {
        memory_limit_kib: opt.memory_limit,
        proc_limit: opt.proc_limit,
    };
    let mut cgroup = Cgroup::create(&cgroup_name, &limits)?;

    // eventfd notification when the kernel offers it, oom_control
    // polling otherwise; both report the same flag
    let oom_watch = match cgroup.oom_watch() {
        Ok(watch) => Some(watch),
        Err(err) => {
            debug!("oom eventfd unavailable, falling back to polling: {:#}", err);
            None
        }
    };

    normalize_oom_score()?;

    sched::unshare(CloneFlags::CLONE_NEWNS).context("failed to unshare mount namespace")?;
    // systemd makes the root mount shared; rebind it private or every
    // in-sandbox mount leaks to the host
    if let Err(err) = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        error!("cannot change root filesystem propagation: {}", err);
    }

    if let Some(ref preexecute) = opt.preexecute {
        info!("executing pre-execute command");
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(preexecute)
            .status()
            .context("failed to spawn pre-execute command")?;
        if !status.success() {
            error!("pre-execute command failed: {}", status);
        }
    }

    if filter.is_none() {
        unshare_isolation(opt)?;
    }

    let (pipe_tx, pipe_rx) = pipe::create()?;

    match unsafe { unistd::fork() }.context("failed to fork")? {
        ForkResult::Parent { child } => {
            drop(pipe_tx);
            parent::run_parent(opt, child, &mut cgroup, oom_watch, pipe_rx, meta)
        }
        ForkResult::Child => {
            drop(pipe_rx);
            match child::run_child(opt, filter.as_ref(), &cgroup) {
                Ok(never) => match never {},
                Err(err) => {
                    pipe_tx.write_error(&err);
                    process::exit(101);
                }
            }
        }
    }
}

/// The unshare path: without a syscall filter, isolation comes from
/// fresh namespaces. With a named netns the child joins it instead of
/// getting an empty one.
fn unshare_isolation(opt: &RunguardOptions) -> Result<()> {
    info!("isolating user program by unshare");

    let base = CloneFlags::CLONE_FILES
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_SYSVSEM;

    match opt.netns {
        None => {
            sched::unshare(base | CloneFlags::CLONE_NEWNET)
                .context("failed to unshare namespaces")?;
        }
        Some(ref name) => {
            sched::unshare(base).context("failed to unshare namespaces")?;
            let path = format!("/var/run/netns/{}", name);
            let fd = fcntl::open(path.as_str(), OFlag::O_RDONLY, Mode::empty())
                .with_context(|| format!("failed to open netns {}", name))?;
            info!("joining existing network namespace {}", name);
            let result = sched::setns(fd, CloneFlags::CLONE_NEWNET);
            let _ = unistd::close(fd);
            result.with_context(|| format!("failed to join netns {}", name))?;
        }
    }

    Ok(())
}

/// A negative OOM-killer bias is inherited (sshd sets one) and turns
/// memory kills into timeouts; reset it to zero.
fn normalize_oom_score() -> Result<()> {
    for path in &["/proc/self/oom_score_adj", "/proc/self/oom_adj"] {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => continue,
        };
        let score: i32 = content.trim().parse().unwrap_or(0);
        if score < 0 {
            info!("resetting {} from {} to 0", path, score);
            fs::write(path, "0\n").with_context(|| format!("cannot write {}", path))?;
        }
        return Ok(());
    }
    Ok(())
}
