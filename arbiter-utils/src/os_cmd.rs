use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use ::tracing::debug;
use anyhow::{Context, Result};

/// Builder for invoking an external program with explicit environment
/// overrides on top of the inherited environment.
pub struct OsCmd {
    pub bin: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

impl OsCmd {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn arg(&mut self, a: impl Into<OsString>) -> &mut Self {
        self.args.push(a.into());
        self
    }

    pub fn env(&mut self, k: impl Into<OsString>, v: impl Into<OsString>) -> &mut Self {
        self.envs.push((k.into(), v.into()));
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdout_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.stderr = Some(path.into());
        self
    }

    /// Runs the command to completion and returns its exit code.
    /// A termination by signal is reported as `128 + signo`.
    pub fn run(&self) -> Result<i32> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(redirection(self.stdout.as_deref())?);
        cmd.stderr(redirection(self.stderr.as_deref())?);

        debug!(bin = %self.bin.display(), args = ?self.args, "executing command");

        let status = cmd
            .status()
            .with_context(|| format!("failed to execute {}", self.bin.display()))?;

        match status.code() {
            Some(code) => Ok(code),
            None => {
                use std::os::unix::process::ExitStatusExt;
                Ok(128 + status.signal().unwrap_or(0))
            }
        }
    }
}

fn redirection(path: Option<&Path>) -> Result<Stdio> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::null()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_is_propagated() {
        let mut cmd = OsCmd::new("/bin/sh");
        cmd.arg("-c").arg("exit 7");
        assert_eq!(cmd.run().unwrap(), 7);
    }

    #[test]
    fn env_override_reaches_child() {
        let out = std::env::temp_dir().join(format!("arbiter-oscmd-{}", std::process::id()));
        let mut cmd = OsCmd::new("/bin/sh");
        cmd.arg("-c")
            .arg("printf '%s' \"$ARBITER_TEST_KEY\"")
            .env("ARBITER_TEST_KEY", "value")
            .stdout_file(&out);
        assert_eq!(cmd.run().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "value");
        let _ = std::fs::remove_file(&out);
    }
}
