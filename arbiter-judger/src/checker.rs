//! Checker protocol: opaque check/run/compare executables with a fixed
//! argv contract, plus the compare-verdict parser.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arbiter_utils::os_cmd::OsCmd;
use strum_macros::EnumString;

#[derive(Debug, Clone, Copy)]
pub enum ScriptKind {
    Check,
    Run,
    Compare,
}

impl ScriptKind {
    fn dir(self) -> &'static str {
        match self {
            ScriptKind::Check => "check",
            ScriptKind::Run => "run",
            ScriptKind::Compare => "compare",
        }
    }
}

/// Script identifiers are opaque names resolved inside the script tree.
pub fn resolve(script_dir: &Path, kind: ScriptKind, name: &str) -> PathBuf {
    script_dir.join(kind.dir()).join(name)
}

/// The fixed prefix every checker script receives:
/// `<cachedir> <workdir> <chrootdir> <datadir> <timelimit_s>
/// <memlimit_KiB> <filelimit_KiB>`.
///
/// The sandbox settings travel through the script environment:
/// `$RUNGUARD` always, plus `$SECCOMP_POLICY`, `$NETNS`, `$SANDBOX_UID`
/// and `$SANDBOX_GID` when configured, for the script to forward to the
/// runguard CLI.
pub struct ScriptEnv<'a> {
    pub cache_dir: &'a Path,
    pub workdir: &'a Path,
    pub chroot_dir: &'a Path,
    pub data_dir: &'a Path,
    pub time_limit: f64,
    pub memory_limit: u64,
    pub file_limit: u64,
    pub runguard: &'a Path,
    pub seccomp_policy: Option<&'a Path>,
    pub netns: Option<&'a str>,
    pub user: Option<u32>,
    pub group: Option<u32>,
}

pub fn invoke(
    script: &Path,
    env: &ScriptEnv<'_>,
    extra: &[&OsStr],
    stdout: Option<&Path>,
    stderr: Option<&Path>,
) -> Result<i32> {
    let mut cmd = OsCmd::new(script);
    cmd.arg(env.cache_dir.as_os_str())
        .arg(env.workdir.as_os_str())
        .arg(env.chroot_dir.as_os_str())
        .arg(env.data_dir.as_os_str())
        .arg(env.time_limit.to_string())
        .arg(env.memory_limit.to_string())
        .arg(env.file_limit.to_string());
    for arg in extra {
        cmd.arg(*arg);
    }
    cmd.env("RUNGUARD", env.runguard.as_os_str());
    if let Some(policy) = env.seccomp_policy {
        cmd.env("SECCOMP_POLICY", policy.as_os_str());
    }
    if let Some(netns) = env.netns {
        cmd.env("NETNS", netns);
    }
    if let Some(uid) = env.user {
        cmd.env("SANDBOX_UID", uid.to_string());
    }
    if let Some(gid) = env.group {
        cmd.env("SANDBOX_GID", gid.to_string());
    }
    cmd.current_dir(env.workdir);
    if let Some(stdout) = stdout {
        cmd.stdout_file(stdout);
    }
    if let Some(stderr) = stderr {
        cmd.stderr_file(stderr);
    }

    cmd.run()
        .with_context(|| format!("failed to invoke checker script: {}", script.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum CompareVerdict {
    #[strum(serialize = "AC")]
    Ac,
    #[strum(serialize = "WA")]
    Wa,
    #[strum(serialize = "PE")]
    Pe,
    #[strum(serialize = "PC")]
    Pc,
}

#[derive(Debug, Clone)]
pub struct CompareReport {
    pub verdict: CompareVerdict,
    pub score: Option<String>,
    pub message: Option<String>,
}

/// Parses the `key: value` records emitted by a compare script. The
/// verdict is mandatory; score and message are free-form.
pub fn parse_compare_report(data: &str) -> Result<CompareReport> {
    let mut verdict = None;
    let mut score = None;
    let mut message = None;

    for (line_id, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = match line.find(':') {
            Some(i) => (line[..i].trim(), line[i + 1..].trim()),
            None => anyhow::bail!("compare report line {} is not a record", line_id + 1),
        };
        match key {
            "verdict" => {
                let parsed: CompareVerdict = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("unknown verdict: {}", value))?;
                if verdict.replace(parsed).is_some() {
                    anyhow::bail!("verdict redefined on line {}", line_id + 1);
                }
            }
            "score" => score = Some(value.to_owned()),
            "message" => message = Some(value.to_owned()),
            _ => {}
        }
    }

    let verdict = verdict.context("compare report has no verdict")?;
    Ok(CompareReport {
        verdict,
        score,
        message,
    })
}
