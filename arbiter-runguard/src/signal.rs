//! Process-wide supervisor signal state. Its lifecycle spans one
//! supervised child: set up before the fork, cleared after the reap,
//! handlers restored to default on exit.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};

use anyhow::{Context, Result};
use libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use nix::unistd::Pid;

static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static RECEIVED_SIGNAL: AtomicI32 = AtomicI32::new(-1);
static RECEIVED_SIGCHLD: AtomicBool = AtomicBool::new(false);
static WALL_HARD_HIT: AtomicBool = AtomicBool::new(false);

const KILL_DELAY: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 100_000_000,
};

/// Unmasks all signals except SIGCHLD and installs a handler that only
/// records its delivery.
pub fn block_sigchld() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)
        .context("failed to set signal mask")?;

    RECEIVED_SIGCHLD.store(false, SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGCHLD, &action) }
        .context("failed to install SIGCHLD handler")?;
    Ok(())
}

extern "C" fn on_sigchld(_: c_int) {
    RECEIVED_SIGCHLD.store(true, SeqCst);
}

pub fn sigchld_seen() -> bool {
    RECEIVED_SIGCHLD.load(SeqCst)
}

/// One-shot SIGTERM (and, with a wall limit, SIGALRM) handler running the
/// graceful-kill protocol against the child's process group.
pub fn install_terminate_handlers(with_alarm: bool) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGALRM);

    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
        mask,
    );

    unsafe { signal::sigaction(Signal::SIGTERM, &action) }
        .context("failed to install SIGTERM handler")?;
    if with_alarm {
        unsafe { signal::sigaction(Signal::SIGALRM, &action) }
            .context("failed to install SIGALRM handler")?;
    }
    Ok(())
}

extern "C" fn on_terminate(sig: c_int) {
    // only async-signal-safe calls from here on
    unsafe {
        restore_handler(libc::SIGTERM);
        restore_handler(libc::SIGALRM);
    }

    if sig == libc::SIGALRM {
        WALL_HARD_HIT.store(true, SeqCst);
    }
    RECEIVED_SIGNAL.store(sig, SeqCst);

    let child = CHILD_PID.load(SeqCst);
    if child > 0 {
        graceful_kill_pgroup(child);
    }
}

unsafe fn restore_handler(sig: c_int) {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(sig, &action, ptr::null_mut());
}

/// First try to kill graciously, then hard. An already-exited group is
/// not an error; any other failure aborts the supervisor.
fn graceful_kill_pgroup(child: i32) {
    unsafe {
        if libc::kill(-child, libc::SIGTERM) != 0 && last_errno() != libc::ESRCH {
            libc::_exit(libc::EXIT_FAILURE);
        }
        libc::nanosleep(&KILL_DELAY, ptr::null_mut());
        if libc::kill(-child, libc::SIGKILL) != 0 && last_errno() != libc::ESRCH {
            libc::_exit(libc::EXIT_FAILURE);
        }
        libc::nanosleep(&KILL_DELAY, ptr::null_mut());
    }
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn received_signal() -> Option<i32> {
    match RECEIVED_SIGNAL.load(SeqCst) {
        sig if sig >= 0 => Some(sig),
        _ => None,
    }
}

pub fn set_received_signal(sig: i32) {
    RECEIVED_SIGNAL.store(sig, SeqCst);
}

pub fn wall_hard_hit() -> bool {
    WALL_HARD_HIT.load(SeqCst)
}

/// Tracks the currently supervised child. If the supervisor leaves by an
/// error path before the reap, the drop SIGKILLs the child's process
/// group so nothing outlives the run.
pub struct ChildGuard {
    pid: Pid,
    reaped: bool,
}

impl ChildGuard {
    pub fn new(pid: Pid) -> Self {
        CHILD_PID.store(pid.as_raw(), SeqCst);
        Self { pid, reaped: false }
    }

    pub fn mark_reaped(&mut self) {
        self.reaped = true;
        CHILD_PID.store(0, SeqCst);
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            unsafe {
                libc::kill(-self.pid.as_raw(), libc::SIGKILL);
                libc::nanosleep(&KILL_DELAY, ptr::null_mut());
            }
            CHILD_PID.store(0, SeqCst);
        }
        unsafe {
            restore_handler(libc::SIGTERM);
            restore_handler(libc::SIGALRM);
            restore_handler(libc::SIGCHLD);
        }
        let _ = signal::sigprocmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::empty()),
            None,
        );
    }
}
