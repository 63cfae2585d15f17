//! CLI that nudges a keyboard's RGB hue toward a target color by driving
//! the `qmk_hid` tool.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::Level;
use via_hue::{ColorSpec, ViaDevice, stepper, via};

#[derive(Parser, Debug)]
#[command(
    name = "via-hue",
    about = "Set the RGB hue of a QMK/VIA-compatible keyboard through qmk_hid",
    after_help = "Examples:\n  \
        via-hue green --vid 0x3434 --pid 0x0011\n  \
        via-hue \"#00ff00\" --vid 0x3434 --pid 0x0011 --save\n  \
        via-hue hsv:300 --vid 3434 --pid 0011 --step 4 --delay-ms 20"
)]
struct Cli {
    /// Color: named (red, yellow, green, cyan, blue, purple),
    /// hex (#RRGGBB or RRGGBB), or hsv:<H> (0..=255 units or 256..=360 degrees)
    color: String,

    /// Vendor ID in hex (e.g. 0x3434 or 3434)
    #[arg(long)]
    vid: String,

    /// Product ID in hex (e.g. 0x0011 or 0011)
    #[arg(long)]
    pid: String,

    /// Hue units moved per step call
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(1..))]
    step: u8,

    /// Delay between steps in milliseconds
    #[arg(long = "delay-ms", default_value_t = 15)]
    delay_ms: u64,

    /// Save the hue to EEPROM after setting it
    #[arg(long)]
    save: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let spec: ColorSpec = cli
        .color
        .parse()
        .with_context(|| format!("cannot parse color {:?}", cli.color))?;
    let target = spec.target_hue();

    match &spec {
        ColorSpec::Named(name) => {
            via::set_named_color(*name, cli.save).await?;
        }
        ColorSpec::Hex { .. } | ColorSpec::Hsv(_) => {
            let mut device = ViaDevice::new(&cli.vid, &cli.pid);
            stepper::converge(
                &mut device,
                target,
                cli.step,
                Duration::from_millis(cli.delay_ms),
                cli.save,
            )
            .await?;
        }
    }

    println!("OK: hue set to {target}");
    Ok(())
}
