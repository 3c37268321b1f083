use crate::cgroup::Cgroup;
use crate::seccomp::SeccompFilter;
use crate::{libc_call, limits, RunguardOptions};

use std::convert::Infallible as Never;
use std::ffi::CString;
use std::io;
use std::path::Path;
use std::ptr;

use anyhow::{Context, Result};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};

pub fn run_child(
    opt: &RunguardOptions,
    filter: Option<&SeccompFilter>,
    cgroup: &Cgroup,
) -> Result<Never> {
    // own process group, so the supervisor can kill the whole subtree
    unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .context("failed to create process group")?;

    libc_call(|| unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) })
        .context("failed to set parent-death signal")?;

    if let Some(ref stdin) = opt.stdin {
        redirect_stdin(stdin).context("failed to redirect stdin")?;
    }
    if let Some(ref stdout) = opt.stdout {
        redirect_stdout(stdout).context("failed to redirect stdout")?;
    }
    if let Some(ref stderr) = opt.stderr {
        redirect_stderr(stderr).context("failed to redirect stderr")?;
    }

    // before exec, so every allocation of the target is accounted
    cgroup.attach_self().context("failed to enter cgroup")?;

    limits::apply_child(opt)?;

    if let Some(filter) = filter {
        // the filter comes last: it would forbid the setup calls above
        filter.load()?;
    }

    let bin = CString::new(opt.command[0].as_str())?;

    let mut c_args = Vec::new();
    let mut argv: Vec<*const libc::c_char> = Vec::with_capacity(opt.command.len() + 1);
    argv.push(bin.as_ptr());
    for arg in &opt.command[1..] {
        let c = CString::new(arg.as_str())?;
        argv.push(c.as_ptr());
        c_args.push(c);
    }
    argv.push(ptr::null());

    unsafe { libc::execvp(bin.as_ptr(), argv.as_ptr()) };

    Err(io::Error::last_os_error())
        .with_context(|| format!("failed to execvp: {}", opt.command[0]))
}

fn redirect_stdin(stdin: &Path) -> nix::Result<()> {
    let fd = fcntl::open(stdin, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    unistd::dup2(fd, libc::STDIN_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}

fn redirect_stdout(stdout: &Path) -> nix::Result<()> {
    let fd = fcntl::open(
        stdout,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    unistd::dup2(fd, libc::STDOUT_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}

fn redirect_stderr(stderr: &Path) -> nix::Result<()> {
    let fd = fcntl::open(
        stderr,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    unistd::dup2(fd, libc::STDERR_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}
