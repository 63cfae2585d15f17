//! Subprocess boundary to the `qmk_hid` device-control tool.
//!
//! The tool is treated as an opaque collaborator with two verbs:
//!
//! - `qmk_hid via --rgb-color <name>` sets a named palette color directly
//!   (no VID/PID needed).
//! - `qmk_hid via --vid <v> --pid <p> --rgb-hue <get|step+|step-|save>`
//!   reads the current hue (stdout integer 0..=255), applies exactly one
//!   hue increment/decrement, or persists the hue to EEPROM.

use crate::color::{NamedColor, StepDirection};
use crate::stepper::HueDevice;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

const TOOL: &str = "qmk_hid";

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const STEP_TIMEOUT: Duration = Duration::from_secs(2);
const SAVE_TIMEOUT: Duration = Duration::from_secs(2);
const COLOR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ViaError {
    #[error("qmk_hid not found in PATH; is it installed?")]
    ToolMissing,
    #[error("failed to launch qmk_hid: {0}")]
    Spawn(std::io::Error),
    #[error("qmk_hid failed: {0}")]
    Device(String),
    #[error("qmk_hid timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected qmk_hid output: {0:?}")]
    BadOutput(String),
}

/// Strips an optional `0x` prefix and lowercases a VID/PID string.
pub fn normalize_hex_id(value: &str) -> String {
    let value = value.trim().to_ascii_lowercase();
    value.strip_prefix("0x").unwrap_or(&value).to_string()
}

async fn run_via(args: &[&str], limit: Duration) -> Result<Output, ViaError> {
    debug!(?args, "invoking {TOOL}");
    let invocation = Command::new(TOOL)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(limit, invocation).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ViaError::ToolMissing);
        }
        Ok(Err(e)) => return Err(ViaError::Spawn(e)),
        Err(_) => return Err(ViaError::Timeout(limit)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("exit status {}", output.status)
        };
        return Err(ViaError::Device(message));
    }

    Ok(output)
}

fn parse_hue_output(stdout: &[u8]) -> Result<u8, ViaError> {
    let text = String::from_utf8_lossy(stdout);
    text.trim()
        .parse::<u8>()
        .map_err(|_| ViaError::BadOutput(text.trim().to_string()))
}

/// Reads the current hue from the device.
pub async fn query_hue(vid: &str, pid: &str) -> Result<u8, ViaError> {
    let vid = normalize_hex_id(vid);
    let pid = normalize_hex_id(pid);
    let output = run_via(
        &["via", "--vid", &vid, "--pid", &pid, "--rgb-hue", "get"],
        QUERY_TIMEOUT,
    )
    .await?;
    parse_hue_output(&output.stdout)
}

/// Applies exactly one hue increment or decrement.
pub async fn step_hue(vid: &str, pid: &str, direction: StepDirection) -> Result<(), ViaError> {
    let vid = normalize_hex_id(vid);
    let pid = normalize_hex_id(pid);
    let verb = match direction {
        StepDirection::Up => "step+",
        StepDirection::Down => "step-",
    };
    run_via(
        &["via", "--vid", &vid, "--pid", &pid, "--rgb-hue", verb],
        STEP_TIMEOUT,
    )
    .await?;
    Ok(())
}

/// Persists the current hue to EEPROM.
pub async fn save_hue(vid: &str, pid: &str) -> Result<(), ViaError> {
    let vid = normalize_hex_id(vid);
    let pid = normalize_hex_id(pid);
    run_via(
        &["via", "--vid", &vid, "--pid", &pid, "--rgb-hue", "save"],
        SAVE_TIMEOUT,
    )
    .await?;
    Ok(())
}

/// Sets a named palette color with a single direct call.
pub async fn set_named_color(color: NamedColor, save: bool) -> Result<(), ViaError> {
    let mut args = vec!["via", "--rgb-color", color.as_str()];
    if save {
        args.push("--save");
    }
    run_via(&args, COLOR_TIMEOUT).await?;
    Ok(())
}

/// A concrete keyboard addressed by VID/PID, driven through `qmk_hid`.
#[derive(Debug, Clone)]
pub struct ViaDevice {
    vid: String,
    pid: String,
}

impl ViaDevice {
    pub fn new(vid: &str, pid: &str) -> Self {
        Self {
            vid: normalize_hex_id(vid),
            pid: normalize_hex_id(pid),
        }
    }
}

impl HueDevice for ViaDevice {
    async fn read_hue(&mut self) -> Result<u8, ViaError> {
        query_hue(&self.vid, &self.pid).await
    }

    async fn step_hue(&mut self, direction: StepDirection) -> Result<(), ViaError> {
        step_hue(&self.vid, &self.pid, direction).await
    }

    async fn save(&mut self) -> Result<(), ViaError> {
        save_hue(&self.vid, &self.pid).await
    }
}
