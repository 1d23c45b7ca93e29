use crate::player::command::PlaybackCommand;
use log::debug;
use std::collections::VecDeque;

/// FIFO backlog of playback requests. Holds at most one pending
/// `UseDefault`; `Quit` is handled by the caller and never stored.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<PlaybackCommand>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the request was dropped as a duplicate default.
    pub fn enqueue(&mut self, command: PlaybackCommand) -> bool {
        debug_assert!(command != PlaybackCommand::Quit, "Quit is never queued");
        if command == PlaybackCommand::UseDefault && self.pending.contains(&command) {
            debug!("Default request already pending, dropping duplicate");
            return false;
        }
        self.pending.push_back(command);
        true
    }

    pub fn dequeue_front(&mut self) -> Option<PlaybackCommand> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
