//! nwall-player - multi-stream hardware-accelerated H.264 video wall
//!
//! Ingests H.264 Annex-B bitstreams from HTTP or local files, feeds them
//! to kernel M2M video decoders, and composites the decoded frames onto
//! one or more linear framebuffers arranged as a wall.

mod config;
mod decoder;
mod display;
mod draw;
mod error;
mod frame;
mod ingest;
mod parser;
mod player;
mod stream;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Cli, Config, FramebufferArg, FramebufferLocation};
use display::framebuffer::{FramebufferDevice, PixelFormat as FbPixelFormat};
use display::linux_fb::LinuxFramebufferDevice;
use player::Player;

fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Resolves every `--framebuffer` entry into an opened device plus the
/// group index it belongs to, splitting on the `new-group` sentinel.
/// `location` only selects a default device path when none is given
/// explicitly (`x`/`y`, always present, are used as-is for the
/// framebuffer's group-relative origin).
fn open_framebuffers(
    args: &[FramebufferArg],
) -> Result<(Vec<(Box<dyn FramebufferDevice>, i32, i32, usize)>, Vec<FbPixelFormat>)> {
    let mut devices: Vec<(Box<dyn FramebufferDevice>, i32, i32, usize)> = Vec::new();
    let mut group_formats: Vec<Option<FbPixelFormat>> = vec![None];
    let mut group_idx = 0usize;
    let mut opened = 0usize;

    for arg in args {
        match arg {
            FramebufferArg::NewGroup => {
                group_idx += 1;
                group_formats.push(None);
            }
            FramebufferArg::Entry {
                location,
                x,
                y,
                device_path,
            } => {
                let path = device_path
                    .clone()
                    .unwrap_or_else(|| default_device_path(*location, opened));
                let device = LinuxFramebufferDevice::open(&path)?;
                let info = device.screen_info()?;
                let format = FbPixelFormat::classify(
                    info.bits_per_pixel,
                    info.r_offset,
                    info.g_offset,
                    info.b_offset,
                )
                .ok_or_else(|| anyhow::anyhow!("framebuffer {path} reports an unsupported pixel format"))?;
                group_formats[group_idx].get_or_insert(format);
                devices.push((Box::new(device), *x, *y, group_idx));
                opened += 1;
            }
        }
    }

    let formats = group_formats
        .into_iter()
        .map(|f| f.unwrap_or(FbPixelFormat::Bgra8888))
        .collect();
    Ok((devices, formats))
}

fn default_device_path(_location: FramebufferLocation, index: usize) -> String {
    format!("/dev/fb{index}")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    init_logging(&config.log_level);

    anyhow::ensure!(
        !config.streams.is_empty() || !config.files.is_empty(),
        "no --stream or --file sources configured"
    );

    let (framebuffer_devices, group_formats) = open_framebuffers(&config.framebuffers)?;

    let mut player = Player::new(config, framebuffer_devices, group_formats)?;
    player.run()
}
