//! Resource restrictions applied around the fork: rlimits, identity and
//! filesystem confinement in the child, privilege shedding and the wall
//! timer in the supervisor.

use crate::{libc_call, signal, RunguardOptions};

use std::ptr;

use anyhow::{Context, Result};
use log::info;
use nix::unistd::{self, Gid, Uid};
use rlimit::{Resource, Rlim};

pub fn apply_child(opt: &RunguardOptions) -> Result<()> {
    if let Some(kib) = opt.file_limit {
        let bytes = Rlim::from_raw(kib * 1024);
        Resource::FSIZE
            .set(bytes, bytes)
            .context("failed to set RLIMIT_FSIZE")?;
    }

    Resource::STACK
        .set(Rlim::INFINITY, Rlim::INFINITY)
        .context("failed to set RLIMIT_STACK")?;

    if let Some(nproc) = opt.proc_limit {
        let nproc = Rlim::from_raw(nproc);
        Resource::NPROC
            .set(nproc, nproc)
            .context("failed to set RLIMIT_NPROC")?;
    }

    if let Some(cpu) = opt.cpu_time {
        // last-resort ceiling: the kernel delivers SIGXCPU past this
        let secs = Rlim::from_raw(cpu_rlimit_secs(cpu.hard));
        Resource::CPU
            .set(secs, secs)
            .context("failed to set RLIMIT_CPU")?;
    }

    if let Some(ref root) = opt.root {
        unistd::chroot(root.as_path())
            .with_context(|| format!("failed to chroot to {}", root.display()))?;
        unistd::chdir("/").context("failed to chdir into chroot")?;
    }

    if let Some(ref dir) = opt.work_dir {
        unistd::chdir(dir.as_path())
            .with_context(|| format!("failed to chdir to {}", dir.display()))?;
    }

    if let Some(gid) = opt.group.map(Gid::from_raw) {
        unistd::setgroups(&[gid]).context("failed to set groups")?;
        unistd::setgid(gid).context("failed to set gid")?;
    }

    if let Some(uid) = opt.user.map(Uid::from_raw) {
        unistd::setuid(uid).context("failed to set uid")?;
    }

    Ok(())
}

pub fn apply_parent(opt: &RunguardOptions) -> Result<()> {
    if opt.user.is_none() {
        // Shed privileges only when no separate child uid is used;
        // killing the child may otherwise still need root.
        unistd::setuid(unistd::getuid()).context("failed to set watchdog uid")?;
    }

    signal::install_terminate_handlers(opt.wall_time.is_some())?;

    if let Some(wall) = opt.wall_time {
        arm_wall_timer(wall.hard)?;
        info!("set hard wall-time limit to {:.3} seconds", wall.hard);
    }

    Ok(())
}

pub(crate) fn cpu_rlimit_secs(hard: f64) -> u64 {
    hard.ceil() as u64 + 1
}

fn arm_wall_timer(hard: f64) -> Result<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: hard.trunc() as libc::time_t,
            tv_usec: (hard.fract() * 1e6) as libc::suseconds_t,
        },
    };

    libc_call(|| unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) })
        .context("failed to arm wall timer")?;
    Ok(())
}
