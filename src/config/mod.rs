//! CLI flags and an optional `config.toml` overlay.
//!
//! This module is deliberately thin: it exists to produce a typed
//! [`Config`] for `Player::new`, using a `clap` + `serde`/`toml` +
//! `directories` split so a deployment can pin values in a file instead
//! of passing dozens of flags.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawMode {
    Src,
    Dst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferLocation {
    Free,
    Left,
    Right,
    Top,
    Bottom,
}

impl std::str::FromStr for FramebufferLocation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            other => Err(format!("unknown framebuffer location {other:?}")),
        }
    }
}

/// One `--framebuffer location:x:y[:device-path]` entry, or the sentinel
/// `new-group` value that seals the current group (in place of a separate
/// `--frame-buffer-new-group` flag interleaved with repeated
/// `--framebuffer` occurrences, whose relative order `clap`'s derive API
/// does not expose across distinct flags).
#[derive(Debug, Clone)]
pub enum FramebufferArg {
    Entry {
        location: FramebufferLocation,
        x: i32,
        y: i32,
        device_path: Option<String>,
    },
    NewGroup,
}

impl std::str::FromStr for FramebufferArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("new-group") {
            return Ok(FramebufferArg::NewGroup);
        }
        let mut parts = s.splitn(4, ':');
        let location = parts
            .next()
            .ok_or_else(|| "missing location".to_string())?
            .parse()?;
        let x = parts
            .next()
            .ok_or_else(|| "missing x".to_string())?
            .parse()
            .map_err(|e| format!("invalid x: {e}"))?;
        let y = parts
            .next()
            .ok_or_else(|| "missing y".to_string())?
            .parse()
            .map_err(|e| format!("invalid y: {e}"))?;
        let device_path = parts.next().map(str::to_string);
        Ok(FramebufferArg::Entry {
            location,
            x,
            y,
            device_path,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "nwall-player")]
#[command(about = "Multi-stream hardware-accelerated H.264 video wall player", long_about = None)]
pub struct Cli {
    #[arg(long, default_value = "0")]
    pub extra_threads: usize,

    #[arg(long, default_value = "10")]
    pub conn_timeout_secs: u64,
    #[arg(long, default_value = "5")]
    pub conn_wait_reconn_secs: u64,
    #[arg(long, default_value = "5")]
    pub decoder_timeout_secs: u64,
    #[arg(long, default_value = "2")]
    pub decoder_wait_reopen_secs: u64,

    #[arg(long, default_value = "3")]
    pub anim_wait: u64,
    #[arg(long, default_value = "1")]
    pub anim_pre_render_secs: u64,

    #[arg(long, default_value = "25")]
    pub frames_per_sec: u32,

    #[arg(long, value_enum, default_value = "src")]
    pub draw_mode: DrawMode,

    #[arg(long = "framebuffer")]
    pub framebuffer: Vec<FramebufferArg>,

    #[arg(long, default_value = "/dev/video0")]
    pub decoder_device: String,

    #[arg(long)]
    pub server: Option<String>,
    #[arg(long, default_value = "80")]
    pub port: u16,
    #[arg(long)]
    pub keep_alive: bool,

    #[arg(long = "stream")]
    pub streams: Vec<String>,
    #[arg(long = "file")]
    pub files: Vec<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value = "16")]
    pub decoders_max: usize,
    #[arg(long, default_value = "2")]
    pub decoders_to_peek_secs: u64,

    #[arg(long)]
    pub sim_decoder_timeout: bool,
    #[arg(long, default_value = "0")]
    pub frames_skip: u64,
    #[arg(long)]
    pub frames_feed_max: Option<u64>,

    #[arg(long)]
    pub secs_run_and_exit: Option<u64>,

    /// Path to an optional `config.toml` overlay; defaults to the
    /// platform config directory if not given and a file exists there.
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// The subset of [`Cli`] fields a `config.toml` may override. Every field
/// is optional so a deployment only needs to list what it wants to pin.
#[derive(Debug, Default, Deserialize)]
pub struct FileOverlay {
    pub extra_threads: Option<usize>,
    pub conn_timeout_secs: Option<u64>,
    pub conn_wait_reconn_secs: Option<u64>,
    pub decoder_timeout_secs: Option<u64>,
    pub decoder_wait_reopen_secs: Option<u64>,
    pub anim_wait: Option<u64>,
    pub anim_pre_render_secs: Option<u64>,
    pub frames_per_sec: Option<u32>,
    pub draw_mode: Option<DrawMode>,
    pub decoder_device: Option<String>,
    pub decoders_max: Option<usize>,
    pub decoders_to_peek_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Typed runtime configuration, assembled from `Cli` with any
/// `config.toml` overlay values substituted in.
#[derive(Debug, Clone)]
pub struct Config {
    pub extra_threads: usize,
    pub conn_timeout: Duration,
    pub conn_wait_reconn: Duration,
    pub decoder_timeout: Duration,
    pub decoder_wait_reopen: Duration,
    pub anim_secs_wait: u64,
    pub anim_pre_render_secs: u64,
    pub screen_refresh_per_sec: u32,
    pub draw_mode: DrawMode,
    pub decoder_device: String,
    pub server: Option<String>,
    pub port: u16,
    pub keep_alive: bool,
    pub streams: Vec<String>,
    pub files: Vec<String>,
    pub log_level: String,
    pub decoders_max: usize,
    pub decoders_to_peek_secs: u64,
    pub sim_decoder_timeout: bool,
    pub frames_skip: u64,
    pub frames_feed_max: Option<u64>,
    pub secs_run_and_exit: Option<u64>,
    pub framebuffers: Vec<FramebufferArg>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let overlay = Self::load_overlay(cli.config_file.clone())?;
        Ok(Self {
            extra_threads: overlay.extra_threads.unwrap_or(cli.extra_threads),
            conn_timeout: Duration::from_secs(
                overlay.conn_timeout_secs.unwrap_or(cli.conn_timeout_secs),
            ),
            conn_wait_reconn: Duration::from_secs(
                overlay
                    .conn_wait_reconn_secs
                    .unwrap_or(cli.conn_wait_reconn_secs),
            ),
            decoder_timeout: Duration::from_secs(
                overlay
                    .decoder_timeout_secs
                    .unwrap_or(cli.decoder_timeout_secs),
            ),
            decoder_wait_reopen: Duration::from_secs(
                overlay
                    .decoder_wait_reopen_secs
                    .unwrap_or(cli.decoder_wait_reopen_secs),
            ),
            anim_secs_wait: overlay.anim_wait.unwrap_or(cli.anim_wait),
            anim_pre_render_secs: overlay
                .anim_pre_render_secs
                .unwrap_or(cli.anim_pre_render_secs),
            screen_refresh_per_sec: overlay.frames_per_sec.unwrap_or(cli.frames_per_sec),
            draw_mode: overlay.draw_mode.unwrap_or(cli.draw_mode),
            decoder_device: overlay.decoder_device.unwrap_or(cli.decoder_device),
            server: cli.server,
            port: cli.port,
            keep_alive: cli.keep_alive,
            streams: cli.streams,
            files: cli.files,
            log_level: overlay.log_level.unwrap_or(cli.log_level),
            decoders_max: overlay.decoders_max.unwrap_or(cli.decoders_max),
            decoders_to_peek_secs: overlay
                .decoders_to_peek_secs
                .unwrap_or(cli.decoders_to_peek_secs),
            sim_decoder_timeout: cli.sim_decoder_timeout,
            frames_skip: cli.frames_skip,
            frames_feed_max: cli.frames_feed_max,
            secs_run_and_exit: cli.secs_run_and_exit,
            framebuffers: cli.framebuffer,
        })
    }

    fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "nwall", "nwall-player")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn load_overlay(explicit: Option<PathBuf>) -> Result<FileOverlay> {
        let path = match explicit {
            Some(p) => p,
            None => match Self::default_config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(FileOverlay::default()),
            },
        };
        if !path.exists() {
            return Ok(FileOverlay::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn framebuffer_location_parses_known_values() {
        assert_eq!(FramebufferLocation::from_str("left").unwrap(), FramebufferLocation::Left);
        assert_eq!(FramebufferLocation::from_str("right").unwrap(), FramebufferLocation::Right);
        assert_eq!(FramebufferLocation::from_str("top").unwrap(), FramebufferLocation::Top);
        assert_eq!(FramebufferLocation::from_str("bottom").unwrap(), FramebufferLocation::Bottom);
        assert_eq!(FramebufferLocation::from_str("free").unwrap(), FramebufferLocation::Free);
    }

    #[test]
    fn framebuffer_location_rejects_unknown_value() {
        assert!(FramebufferLocation::from_str("center").is_err());
    }

    #[test]
    fn framebuffer_arg_parses_new_group_sentinel_case_insensitively() {
        assert!(matches!(FramebufferArg::from_str("new-group").unwrap(), FramebufferArg::NewGroup));
        assert!(matches!(FramebufferArg::from_str("New-Group").unwrap(), FramebufferArg::NewGroup));
    }

    #[test]
    fn framebuffer_arg_parses_entry_without_device_path() {
        let arg = FramebufferArg::from_str("left:10:20").unwrap();
        match arg {
            FramebufferArg::Entry { location, x, y, device_path } => {
                assert_eq!(location, FramebufferLocation::Left);
                assert_eq!(x, 10);
                assert_eq!(y, 20);
                assert_eq!(device_path, None);
            }
            FramebufferArg::NewGroup => panic!("expected an Entry"),
        }
    }

    #[test]
    fn framebuffer_arg_parses_entry_with_device_path() {
        let arg = FramebufferArg::from_str("right:-5:0:/dev/fb1").unwrap();
        match arg {
            FramebufferArg::Entry { location, x, y, device_path } => {
                assert_eq!(location, FramebufferLocation::Right);
                assert_eq!(x, -5);
                assert_eq!(y, 0);
                assert_eq!(device_path.as_deref(), Some("/dev/fb1"));
            }
            FramebufferArg::NewGroup => panic!("expected an Entry"),
        }
    }

    #[test]
    fn framebuffer_arg_rejects_missing_fields() {
        assert!(FramebufferArg::from_str("left:10").is_err());
        assert!(FramebufferArg::from_str("left").is_err());
    }

    #[test]
    fn framebuffer_arg_rejects_non_numeric_coordinates() {
        assert!(FramebufferArg::from_str("left:x:20").is_err());
    }
}
