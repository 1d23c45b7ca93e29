use std::fmt;

pub const QUIT_TOKEN: &str = "exit";
pub const DEFAULT_TOKEN: &str = "none";

/// A decoded request from the command channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaybackCommand {
    /// Replay the configured default source.
    UseDefault,
    /// Shut the player down. Never queued.
    Quit,
    /// Play the source at the given path or URI.
    Open(String),
}

impl fmt::Display for PlaybackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackCommand::UseDefault => f.write_str("<default>"),
            PlaybackCommand::Quit => f.write_str("<quit>"),
            PlaybackCommand::Open(path) => f.write_str(path),
        }
    }
}

/// Decodes a raw channel token. Total over all strings: anything that is not
/// a sentinel is taken to be a source identifier, malformed input included.
pub fn decode(token: &str) -> PlaybackCommand {
    match token {
        QUIT_TOKEN => PlaybackCommand::Quit,
        DEFAULT_TOKEN => PlaybackCommand::UseDefault,
        other => PlaybackCommand::Open(other.to_string()),
    }
}
