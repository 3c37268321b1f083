//! Error channel between the pre-exec child and the supervisor. The
//! write end is close-on-exec: a successful exec closes it and the
//! supervisor reads EOF as success.

use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;

pub struct PipeTx(RawFd);
pub struct PipeRx(RawFd);

pub fn create() -> Result<(PipeTx, PipeRx)> {
    let (rx, tx) = unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create pipe")?;
    Ok((PipeTx(tx), PipeRx(rx)))
}

impl PipeTx {
    pub fn write_error(&self, err: &anyhow::Error) {
        let msg = format!("{:#}", err);
        let _ = unistd::write(self.0, msg.as_bytes());
    }
}

impl PipeRx {
    /// Blocks until the child execs (EOF, `None`) or reports a setup
    /// failure (`Some(message)`).
    pub fn read_error(&self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match unistd::read(self.0, &mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(err) => return Err(err).context("failed to read from child pipe"),
            }
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
        }
    }
}

impl Drop for PipeTx {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

impl Drop for PipeRx {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}
