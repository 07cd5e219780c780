//! Small helpers layered on top of [`std::process::Command`].

use std::process::Command;

use anyhow::{Context, Result};

/// Extension trait for [`Command`] that turns a non-zero exit status into an
/// `Err` carrying the command's stderr, instead of requiring the caller to
/// inspect `ExitStatus` by hand.
pub trait CommandRunExt {
    /// Run the command to completion, erroring (with the command's stderr
    /// attached as context) if it did not exit successfully.
    fn run(&mut self) -> Result<()>;

    /// Run the command to completion and return its captured stdout as a
    /// `String`, erroring if it did not exit successfully.
    fn run_capture_stdout(&mut self) -> Result<String>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let st = self
            .status()
            .with_context(|| format!("Spawning {self:?}"))?;
        if !st.success() {
            anyhow::bail!("Command {self:?} failed: {st:?}");
        }
        Ok(())
    }

    fn run_capture_stdout(&mut self) -> Result<String> {
        let out = self
            .output()
            .with_context(|| format!("Spawning {self:?}"))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            anyhow::bail!("Command {self:?} failed: {:?}: {stderr}", out.status);
        }
        String::from_utf8(out.stdout).context("Command output was not valid UTF-8")
    }
}
