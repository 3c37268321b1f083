use crate::cgroup::{Cgroup, OomWatch};
use crate::meta::{ExecutionReport, MemoryResult, MetaFile, TimeResult};
use crate::pipe::PipeRx;
use crate::{limits, signal, RunguardOptions};

use std::mem;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

const TIMELIMIT_SOFT: u8 = 1;
const TIMELIMIT_HARD: u8 = 2;

pub fn run_parent(
    opt: &RunguardOptions,
    child: Pid,
    cgroup: &mut Cgroup,
    oom_watch: Option<OomWatch>,
    pipe_rx: PipeRx,
    meta: &mut MetaFile,
) -> Result<i32> {
    debug!("child pid = {}", child);
    let mut guard = signal::ChildGuard::new(child);

    limits::apply_parent(opt)?;

    if let Some(err) = pipe_rx.read_error()? {
        // the guard and the cgroup drop clean up the half-started child
        anyhow::bail!("child setup failed: {}", err);
    }

    let t0 = Instant::now();
    let ticks0 = times_snapshot()?;

    let status = loop {
        match waitpid(child, Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => break status,
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(err) => return Err(err).context("waitpid failed"),
        }
    };

    let wall_time = t0.elapsed().as_secs_f64();
    let ticks1 = times_snapshot()?;

    info!("child process exited");
    debug!("status = {:?}, sigchld = {}", status, signal::sigchld_seen());

    let mut cpu_hard = false;
    let exit_code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => {
            signal::set_received_signal(sig as i32);
            if sig == Signal::SIGXCPU {
                cpu_hard = true;
                warn!("time limit exceeded (hard cpu time)");
            } else {
                warn!("command terminated with signal {}", sig);
            }
            128 + sig as i32
        }
        WaitStatus::Stopped(_, sig) => {
            signal::set_received_signal(sig as i32);
            warn!("command stopped with signal {}", sig);
            128 + sig as i32
        }
        other => anyhow::bail!("unexpected wait status: {:?}", other),
    };
    guard.mark_reaped();

    unistd::setuid(unistd::getuid()).context("failed to drop privileges")?;

    let tps = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
    let user_time = (ticks1.tms_cutime - ticks0.tms_cutime) as f64 / tps;
    let sys_time = (ticks1.tms_cstime - ticks0.tms_cstime) as f64 / tps;

    let report = summarize_cgroup(
        opt, cgroup, oom_watch, exit_code, cpu_hard, wall_time, user_time, sys_time,
    )?;
    report.write_to(meta);

    info!(
        "run time: real {:.3}, user {:.3}, sys {:.3}",
        report.wall_time, report.user_time, report.sys_time
    );

    Ok(exit_code)
}

/// Reads the final counters, kills every straggler in the group so the
/// timing covers the whole process tree, and deletes the cgroup.
#[allow(clippy::too_many_arguments)]
fn summarize_cgroup(
    opt: &RunguardOptions,
    cgroup: &mut Cgroup,
    oom_watch: Option<OomWatch>,
    exit_code: i32,
    cpu_hard: bool,
    wall_time: f64,
    user_time: f64,
    sys_time: f64,
) -> Result<ExecutionReport> {
    let memory_bytes = cgroup.read_memory_max()?;
    info!("total memory used: {} KiB", memory_bytes / 1024);

    let cpu_time = cgroup.read_cpu_ns()? as f64 / 1e9;

    let is_oom = match oom_watch {
        Some(watch) => watch.triggered(),
        None => cgroup.read_oom()?,
    };

    cgroup.kill_all()?;
    cgroup.destroy()?;

    let mut wall_bits = 0u8;
    let mut cpu_bits = 0u8;

    if signal::wall_hard_hit() {
        wall_bits |= TIMELIMIT_HARD;
    }
    if let Some(wall) = opt.wall_time {
        if wall_time > wall.soft {
            wall_bits |= TIMELIMIT_SOFT;
            warn!("time limit exceeded (soft wall time)");
        }
    }
    if let Some(cpu) = opt.cpu_time {
        if cpu_time > cpu.soft {
            cpu_bits |= TIMELIMIT_SOFT;
            warn!("time limit exceeded (soft cpu time)");
        }
    }
    if cpu_hard {
        cpu_bits |= TIMELIMIT_HARD;
    }

    Ok(ExecutionReport {
        exit_code,
        signal: signal::received_signal(),
        wall_time,
        user_time,
        sys_time,
        cpu_time,
        memory_bytes,
        memory_result: if is_oom {
            MemoryResult::Oom
        } else {
            MemoryResult::None
        },
        time_result: time_result_from_bits(wall_bits | cpu_bits),
        internal_error: None,
    })
}

fn time_result_from_bits(bits: u8) -> TimeResult {
    match bits {
        0 => TimeResult::None,
        TIMELIMIT_SOFT => TimeResult::Soft,
        _ => TimeResult::Hard,
    }
}

fn times_snapshot() -> Result<libc::tms> {
    let mut ticks: libc::tms = unsafe { mem::zeroed() };
    let ret = unsafe { libc::times(&mut ticks) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error()).context("failed to read clock ticks");
    }
    Ok(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_result_bitmap() {
        assert_eq!(time_result_from_bits(0), TimeResult::None);
        assert_eq!(time_result_from_bits(TIMELIMIT_SOFT), TimeResult::Soft);
        assert_eq!(time_result_from_bits(TIMELIMIT_HARD), TimeResult::Hard);
        assert_eq!(
            time_result_from_bits(TIMELIMIT_SOFT | TIMELIMIT_HARD),
            TimeResult::Hard
        );
    }
}
