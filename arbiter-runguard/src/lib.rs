#![deny(clippy::all)]

pub mod cgroup;
pub mod meta;
pub mod seccomp;

mod child;
mod limits;
mod parent;
mod pipe;
mod run;
mod signal;
mod syscalls;

pub use self::run::run;

use std::io;
use std::num::ParseFloatError;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use structopt::StructOpt;

/// Soft and hard variant of a time limit, in fractional seconds.
///
/// Parsed from `<soft>:<hard>`; a bare value sets both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitPair {
    pub soft: f64,
    pub hard: f64,
}

impl FromStr for LimitPair {
    type Err = ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.find(':') {
            Some(i) => Ok(Self {
                soft: s[..i].parse()?,
                hard: s[i + 1..].parse()?,
            }),
            None => {
                let v: f64 = s.parse()?;
                Ok(Self { soft: v, hard: v })
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, StructOpt)]
pub struct RunguardOptions {
    /// Chroot into this directory before executing the command
    #[structopt(long)]
    pub root: Option<PathBuf>,

    /// Working directory of the command (relative to --root if given)
    #[structopt(long = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// Run the command under this uid
    #[structopt(long)]
    pub user: Option<u32>,

    /// Run the command under this gid
    #[structopt(long)]
    pub group: Option<u32>,

    /// Wall-clock time limit, `<soft>:<hard>` seconds
    #[structopt(long = "wall-time")]
    pub wall_time: Option<LimitPair>,

    /// CPU time limit, `<soft>:<hard>` seconds
    #[structopt(long = "cpu-time")]
    pub cpu_time: Option<LimitPair>,

    /// Memory limit in KiB, enforced through the cgroup
    #[structopt(long = "memory")]
    pub memory_limit: Option<u64>,

    /// Per-file output limit in KiB
    #[structopt(long = "file-size")]
    pub file_limit: Option<u64>,

    /// Process-count limit
    #[structopt(long = "nproc")]
    pub proc_limit: Option<u64>,

    #[structopt(long)]
    pub stdin: Option<PathBuf>,

    #[structopt(long)]
    pub stdout: Option<PathBuf>,

    #[structopt(long)]
    pub stderr: Option<PathBuf>,

    /// Destination of the meta report
    #[structopt(long = "meta")]
    pub metafile: Option<PathBuf>,

    /// Join an existing network namespace instead of creating a new one
    #[structopt(long)]
    pub netns: Option<String>,

    /// Shell command run once after namespace setup, before the fork
    #[structopt(long)]
    pub preexecute: Option<String>,

    /// Syscall policy file; its absence selects the unshare path
    #[structopt(long)]
    pub seccomp: Option<PathBuf>,

    /// Override the auto-generated cgroup name
    #[structopt(long)]
    pub cgroup: Option<String>,

    /// Target command
    #[structopt(last = true, required = true)]
    pub command: Vec<String>,
}

pub(crate) fn libc_call(f: impl FnOnce() -> i32) -> io::Result<i32> {
    let ret = f();
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_pair_from_str() {
        let p: LimitPair = "1.5:2".parse().unwrap();
        assert!((p.soft - 1.5).abs() < f64::EPSILON);
        assert!((p.hard - 2.0).abs() < f64::EPSILON);

        let p: LimitPair = "3".parse().unwrap();
        assert!((p.soft - 3.0).abs() < f64::EPSILON);
        assert!((p.hard - 3.0).abs() < f64::EPSILON);

        assert!("one:two".parse::<LimitPair>().is_err());
    }

    #[test]
    fn cli_parsing() {
        let opt = RunguardOptions::from_iter(&[
            "runguard",
            "--wall-time",
            "2:3",
            "--cpu-time",
            "1:1.5",
            "--memory",
            "32768",
            "--file-size",
            "32768",
            "--meta",
            "/tmp/meta",
            "--work-dir",
            "/tmp/w",
            "--",
            "/bin/echo",
            "hi",
        ]);
        assert_eq!(opt.memory_limit, Some(32768));
        assert_eq!(opt.file_limit, Some(32768));
        assert!(opt.seccomp.is_none());
        assert_eq!(opt.command, vec!["/bin/echo".to_owned(), "hi".to_owned()]);
        assert!((opt.wall_time.unwrap().hard - 3.0).abs() < f64::EPSILON);
    }
}
