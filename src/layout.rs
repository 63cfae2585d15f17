//! Active keyboard layout lookup.
//!
//! The OS-specific mechanism lives behind an external command; this module
//! only owns the probing contract.

use anyhow::{Context, Result, bail};
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of the currently active keyboard layout code.
pub trait LayoutSource: Send + 'static {
    fn current_layout(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Probes the layout by running a configured command and reading the first
/// line of its stdout (e.g. `xkb-switch` printing `us`).
pub struct CommandLayoutSource {
    argv: Vec<String>,
}

impl CommandLayoutSource {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl LayoutSource for CommandLayoutSource {
    async fn current_layout(&mut self) -> Result<Option<String>> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("layout command is empty");
        };

        let invocation = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(PROBE_TIMEOUT, invocation)
            .await
            .with_context(|| format!("layout command timed out: {program}"))?
            .with_context(|| format!("failed to run layout command: {program}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("layout command failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = stdout.lines().next().unwrap_or("").trim();
        if code.is_empty() {
            Ok(None)
        } else {
            Ok(Some(code.to_string()))
        }
    }
}
