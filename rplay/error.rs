use std::io::Error as IoError;
use thiserror::Error;
use zbus::Error as ZbusError;

#[derive(Error, Debug)]
pub enum App {
    #[error("I/O operation failed: {0}")]
    Io(#[from] IoError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("relayplay is not running on {0}")]
    NotRunning(String),
    #[error("Zbus error: {0}")]
    Zbus(#[from] ZbusError),
}
