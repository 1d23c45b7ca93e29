pub mod backend;
pub mod command;
pub mod controller;
pub mod gst_logic;
pub mod pacer;
pub mod queue;

pub use self::backend::{CommandChannel, FramePoll, Placement};
pub use self::controller::{PlaybackController, PlayerSettings};
pub use self::gst_logic::GstBackend;
pub use self::pacer::FramePacer;
