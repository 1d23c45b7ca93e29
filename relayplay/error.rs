use flexi_logger::FlexiLoggerError;
use std::io;
use thiserror::Error;
use zbus::Error as ZbusError;

#[derive(Error, Debug)]
pub enum App {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Logger initialization error: {0}")]
    Logger(#[from] FlexiLoggerError),

    #[error("ZBus error: {0}")]
    ZBus(#[from] ZbusError),

    #[error("Command channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("GStreamer initialization error: {0}")]
    Init(#[from] glib::Error),

    #[error("GStreamer element error: {0}")]
    Element(String),

    #[error("GStreamer pipeline error: {0}")]
    Pipeline(String),

    #[error("GStreamer state error: {0}")]
    State(String),

    #[error("Could not open `{source_id}`: {reason}")]
    SourceOpen { source_id: String, reason: String },
}

impl App {
    pub fn source_open(source_id: &str, reason: impl Into<String>) -> Self {
        App::SourceOpen {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}
