use crate::error::App;

/// Inbound source of raw command tokens.
pub trait CommandChannel {
    /// Returns immediately. `Ok(None)` means nothing is waiting.
    fn try_receive(&mut self) -> Result<Option<String>, App>;

    /// Releases the endpoint. Calling it more than once is harmless.
    fn close(&mut self);
}

/// Where and under which name frames are shown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub window_name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Result of asking a source for its next frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FramePoll<F> {
    Ready(F),
    /// Nothing decoded within the backend's bounded wait; the source is
    /// still open.
    Pending,
    /// End of stream, or the source gave up.
    Ended,
}

/// Video decode and display. Each call is expected to return within a
/// bounded time, except `open`, which has no timeout of its own.
pub trait RenderBackend {
    type Handle;
    type Frame;

    fn open(&mut self, source_id: &str, placement: &Placement) -> Result<Self::Handle, App>;

    /// Native rate in Hz, or `None` if the source does not report one.
    fn native_frame_rate(&self, handle: &Self::Handle) -> Option<f64>;

    /// Must return within the frame wait bound so commands keep being polled.
    fn next_frame(&mut self, handle: &mut Self::Handle) -> FramePoll<Self::Frame>;

    fn display(&mut self, frame: Self::Frame, placement: &Placement) -> Result<(), App>;

    /// Whether the operator asked to stop from the display window.
    fn break_requested(&mut self) -> bool;

    fn release(&mut self, handle: Self::Handle);

    /// Destroys the display window. Calling it more than once is harmless.
    fn close(&mut self);
}
