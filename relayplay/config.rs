use crate::dbus::DEFAULT_BUS_NAME;
use crate::error::App;
use crate::player::pacer::DEFAULT_MAX_FRAME_WAIT_MS;
use crate::player::{Placement, PlayerSettings};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_WINDOW_NAME: &str = "relayplay";
const DEFAULT_WIDTH: u32 = 960;
const DEFAULT_HEIGHT: u32 = 540;
const DEFAULT_IDLE_SLEEP_MS: u64 = 250;

#[derive(Parser, Debug, Default)]
#[command(
    name = "relayplay",
    about = "Play videos requested over D-Bus.",
    version
)]
pub struct Args {
    #[arg(short = 'n', long = "name", help = "D-Bus name to listen on")]
    pub name: Option<String>,

    #[arg(long = "window-name", help = "Title of the video window")]
    pub window_name: Option<String>,

    #[arg(short = 'x', allow_negative_numbers = true, help = "Horizontal window position")]
    pub x: Option<i32>,

    #[arg(short = 'y', allow_negative_numbers = true, help = "Vertical window position")]
    pub y: Option<i32>,

    #[arg(short = 'H', long = "height", help = "Height of the video")]
    pub height: Option<u32>,

    #[arg(short = 'W', long = "width", help = "Width of the video")]
    pub width: Option<u32>,

    #[arg(short = 'd', long = "default", help = "Video played at startup and on `none`")]
    pub default: Option<String>,

    #[arg(
        short = 's',
        long = "speedup",
        help = "Pacing divisor while more than one request is waiting"
    )]
    pub speedup: Option<u32>,

    #[arg(long = "no-break-out", action = clap::ArgAction::SetTrue, help = "Ignore Escape in the video window")]
    pub no_break_out: bool,

    #[arg(long = "idle-sleep-ms", help = "Sleep between polls while nothing is queued")]
    pub idle_sleep_ms: Option<u64>,

    #[arg(long = "max-frame-wait-ms", help = "Upper bound on the wait between frames")]
    pub max_frame_wait_ms: Option<u64>,

    #[arg(long = "log-level", help = "Log specification, e.g. `info` or `debug`")]
    pub log_level: Option<String>,

    #[arg(short = 'c', long = "config", help = "Path to a TOML config file")]
    pub config: Option<PathBuf>,
}

/// Values read from the config file; every key is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub name: Option<String>,
    pub window_name: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub default: Option<String>,
    pub speedup: Option<u32>,
    pub allow_break_out: Option<bool>,
    pub idle_sleep_ms: Option<u64>,
    pub max_frame_wait_ms: Option<u64>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load_from_file(file_path: &Path) -> Result<Self, App> {
        let content = std::fs::read_to_string(file_path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug)]
pub struct Settings {
    pub name: String,
    pub player: PlayerSettings,
    pub speedup: u32,
    pub max_frame_wait_ms: u64,
    pub log_level: String,
    /// The file the settings were read from, if any. Runs before the logger
    /// exists, so the caller reports it once logging is up.
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Reads the config file named by `--config`, or the one in the config
    /// directory if it exists, and layers the command line on top.
    pub fn load(args: Args) -> Result<Self, App> {
        let config_file = match &args.config {
            Some(path) => Some(path.clone()),
            None => Some(config_dir()?.join("config.toml")).filter(|path| path.exists()),
        };
        let file = match &config_file {
            Some(path) => FileConfig::load_from_file(path)?,
            None => FileConfig::default(),
        };
        Ok(Self {
            config_file,
            ..Self::resolve(args, file)?
        })
    }

    pub fn resolve(args: Args, file: FileConfig) -> Result<Self, App> {
        let width = args.width.or(file.width).unwrap_or(DEFAULT_WIDTH);
        let height = args.height.or(file.height).unwrap_or(DEFAULT_HEIGHT);
        let speedup = args.speedup.or(file.speedup).unwrap_or(1);
        let idle_sleep_ms = args
            .idle_sleep_ms
            .or(file.idle_sleep_ms)
            .unwrap_or(DEFAULT_IDLE_SLEEP_MS);
        let max_frame_wait_ms = args
            .max_frame_wait_ms
            .or(file.max_frame_wait_ms)
            .unwrap_or(DEFAULT_MAX_FRAME_WAIT_MS);

        if width == 0 || height == 0 {
            return Err(App::Config(format!(
                "window size must be non-zero, got {width}x{height}"
            )));
        }
        if speedup == 0 {
            return Err(App::Config("speedup must be at least 1".to_string()));
        }
        if idle_sleep_ms == 0 {
            return Err(App::Config("idle sleep must be non-zero".to_string()));
        }
        if max_frame_wait_ms == 0 {
            return Err(App::Config("max frame wait must be non-zero".to_string()));
        }

        let allow_break_out = !args.no_break_out && file.allow_break_out.unwrap_or(true);
        let default_source = args
            .default
            .or(file.default)
            .filter(|source| !source.trim().is_empty());

        Ok(Self {
            name: args
                .name
                .or(file.name)
                .unwrap_or_else(|| DEFAULT_BUS_NAME.to_string()),
            player: PlayerSettings {
                placement: Placement {
                    window_name: args
                        .window_name
                        .or(file.window_name)
                        .unwrap_or_else(|| DEFAULT_WINDOW_NAME.to_string()),
                    x: args.x.or(file.x).unwrap_or(0),
                    y: args.y.or(file.y).unwrap_or(0),
                    width,
                    height,
                },
                default_source,
                allow_break_out,
                idle_sleep: Duration::from_millis(idle_sleep_ms),
            },
            speedup,
            max_frame_wait_ms,
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            config_file: None,
        })
    }
}

pub fn config_dir() -> Result<PathBuf, App> {
    let home_dir = std::env::var("HOME")?;
    Ok(PathBuf::from(format!("{home_dir}/.config/relayplay")))
}
