use crate::player::backend::{CommandChannel, FramePoll, Placement, RenderBackend};
use crate::player::command::{decode, PlaybackCommand};
use crate::player::pacer::{validate_frame_rate, FramePacer};
use crate::player::queue::RequestQueue;
use log::{debug, error, info, warn};
use std::mem;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Why the control loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    Quit,
    Signal,
    BreakOut,
}

#[derive(Clone, Debug)]
pub struct PlayerSettings {
    pub placement: Placement,
    pub default_source: Option<String>,
    pub allow_break_out: bool,
    pub idle_sleep: Duration,
}

struct ActiveSource<H> {
    source_id: String,
    handle: H,
    frame_rate: f64,
}

enum Phase<H> {
    Idle,
    Playing(ActiveSource<H>),
    ShuttingDown(Shutdown),
}

/// Owns the request queue, the open source and both external endpoints, and
/// interleaves command polling with frame output on a single task.
pub struct PlaybackController<C: CommandChannel, B: RenderBackend> {
    settings: PlayerSettings,
    pacer: FramePacer,
    queue: RequestQueue,
    channel: C,
    backend: B,
    phase: Phase<B::Handle>,
    stop_signal: Option<watch::Receiver<()>>,
    waiting_announced: bool,
    torn_down: bool,
}

impl<C: CommandChannel, B: RenderBackend> PlaybackController<C, B> {
    pub fn new(settings: PlayerSettings, pacer: FramePacer, channel: C, backend: B) -> Self {
        Self {
            settings,
            pacer,
            queue: RequestQueue::new(),
            channel,
            backend,
            phase: Phase::Idle,
            stop_signal: None,
            waiting_announced: false,
            torn_down: false,
        }
    }

    /// Any value sent on `stop_signal` shuts the loop down at its next poll.
    #[must_use]
    pub fn with_stop_signal(mut self, stop_signal: watch::Receiver<()>) -> Self {
        self.stop_signal = Some(stop_signal);
        self
    }

    /// Opens the configured default source, if there is one.
    pub fn start(&mut self) {
        if let Some(default_source) = self.settings.default_source.clone() {
            self.load(default_source);
        }
    }

    pub async fn run(&mut self) -> Shutdown {
        self.start();
        loop {
            if let Some(reason) = self.step().await {
                return reason;
            }
        }
    }

    /// One loop iteration: a single poll, then either one frame, one load
    /// attempt or one idle sleep. Returns `Some` once shut down.
    pub async fn step(&mut self) -> Option<Shutdown> {
        if let Phase::ShuttingDown(reason) = self.phase {
            return Some(reason);
        }

        if let Some(reason) = self.poll() {
            self.shutdown(reason);
            return Some(reason);
        }

        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Playing(active) => self.play_frame(active).await,
            Phase::Idle => {
                self.serve_next().await;
                None
            }
            Phase::ShuttingDown(reason) => {
                self.phase = Phase::ShuttingDown(reason);
                Some(reason)
            }
        }
    }

    /// Decodes one token. `Quit` is returned to the caller instead of queued.
    pub fn handle_token(&mut self, token: &str) -> Option<Shutdown> {
        match decode(token) {
            PlaybackCommand::Quit => {
                info!("Quit requested");
                Some(Shutdown::Quit)
            }
            command => {
                if self.queue.enqueue(command.clone()) {
                    info!("Queued {} ({} pending)", command, self.queue.len());
                }
                None
            }
        }
    }

    /// Releases the open source, the display window and the command channel.
    /// Only the first call has any effect.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if !self.queue.is_empty() {
            info!("Discarding {} pending requests", self.queue.len());
        }
        info!("Closing media streams.");
        if let Phase::Playing(active) = mem::replace(&mut self.phase, Phase::Idle) {
            self.backend.release(active.handle);
        }
        self.backend.close();

        info!("Closing command channel.");
        self.channel.close();
    }

    fn shutdown(&mut self, reason: Shutdown) {
        info!("Shutting down ({:?})", reason);
        self.teardown();
        self.phase = Phase::ShuttingDown(reason);
    }

    fn poll(&mut self) -> Option<Shutdown> {
        if let Some(stop_signal) = &self.stop_signal {
            // Compares versions only, so a sender dropped after firing still counts.
            if stop_signal.borrow().has_changed() {
                info!("Termination signal received");
                return Some(Shutdown::Signal);
            }
        }

        match self.channel.try_receive() {
            Ok(Some(token)) => self.handle_token(&token),
            Ok(None) => None,
            Err(e) => {
                debug!("Nothing read from command channel: {}", e);
                None
            }
        }
    }

    async fn play_frame(&mut self, mut active: ActiveSource<B::Handle>) -> Option<Shutdown> {
        let frame = match self.backend.next_frame(&mut active.handle) {
            FramePoll::Ready(frame) => frame,
            FramePoll::Pending => {
                // The backend already waited; poll again before the next try.
                self.phase = Phase::Playing(active);
                return None;
            }
            FramePoll::Ended => {
                info!("Finished playing {}", active.source_id);
                self.backend.release(active.handle);
                return None;
            }
        };

        if let Err(e) = self.backend.display(frame, &self.settings.placement) {
            warn!("Failed to display frame of {}: {}", active.source_id, e);
        }

        let wait = self.pacer.wait_millis(active.frame_rate, self.queue.len());
        self.phase = Phase::Playing(active);
        sleep(Duration::from_millis(wait)).await;

        if self.settings.allow_break_out && self.backend.break_requested() {
            info!("Playback interrupted from the display window");
            self.shutdown(Shutdown::BreakOut);
            return Some(Shutdown::BreakOut);
        }
        None
    }

    async fn serve_next(&mut self) {
        let Some(command) = self.queue.dequeue_front() else {
            if !self.waiting_announced {
                info!("Waiting for video . . .");
                self.waiting_announced = true;
            }
            sleep(self.settings.idle_sleep).await;
            return;
        };
        self.waiting_announced = false;

        let source_id = match command {
            PlaybackCommand::Open(path) => path,
            PlaybackCommand::UseDefault => match &self.settings.default_source {
                Some(default_source) => default_source.clone(),
                None => {
                    warn!("Default video requested but none is configured");
                    return;
                }
            },
            PlaybackCommand::Quit => return,
        };
        self.load(source_id);
    }

    fn load(&mut self, source_id: String) {
        info!("Loading file: {}", source_id);
        match self.backend.open(&source_id, &self.settings.placement) {
            Ok(handle) => {
                let reported = self.backend.native_frame_rate(&handle);
                let frame_rate = validate_frame_rate(&source_id, reported);
                info!("Playing {} at {:.2} fps", source_id, frame_rate);
                self.phase = Phase::Playing(ActiveSource {
                    source_id,
                    handle,
                    frame_rate,
                });
            }
            Err(e) => error!("{}", e),
        }
    }
}

#[cfg(test)]
impl<C: CommandChannel, B: RenderBackend> PlaybackController<C, B> {
    fn backlog(&self) -> usize {
        self.queue.len()
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }
}

impl<C: CommandChannel, B: RenderBackend> Drop for PlaybackController<C, B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::App;
    use crate::player::pacer::DEFAULT_MAX_FRAME_WAIT_MS;
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Journal {
        attempted: Vec<String>,
        displayed: Vec<(String, usize)>,
        released: Vec<String>,
        window_closed: usize,
        channel_closed: usize,
    }

    type Shared = Rc<RefCell<Journal>>;

    enum Poll {
        Nothing,
        Token(&'static str),
        Fail,
    }

    struct ScriptedChannel {
        script: VecDeque<Poll>,
        journal: Shared,
    }

    impl CommandChannel for ScriptedChannel {
        fn try_receive(&mut self) -> Result<Option<String>, App> {
            match self.script.pop_front() {
                Some(Poll::Token(token)) => Ok(Some(token.to_string())),
                Some(Poll::Fail) => Err(App::ChannelUnavailable("gone".to_string())),
                Some(Poll::Nothing) | None => Ok(None),
            }
        }

        fn close(&mut self) {
            self.journal.borrow_mut().channel_closed += 1;
        }
    }

    struct FakeSource {
        frames: usize,
        rate: Option<f64>,
    }

    struct FakeHandle {
        source_id: String,
        rate: Option<f64>,
        remaining: usize,
        next_index: usize,
        stalls: usize,
    }

    struct FakeBackend {
        sources: HashMap<String, FakeSource>,
        /// Polls answered with `Pending` before a source yields its first frame.
        stalls: HashMap<String, usize>,
        break_after: Option<usize>,
        journal: Shared,
    }

    impl RenderBackend for FakeBackend {
        type Handle = FakeHandle;
        type Frame = (String, usize);

        fn open(&mut self, source_id: &str, _placement: &Placement) -> Result<FakeHandle, App> {
            self.journal.borrow_mut().attempted.push(source_id.to_string());
            let source = self
                .sources
                .get(source_id)
                .ok_or_else(|| App::source_open(source_id, "no such file"))?;
            Ok(FakeHandle {
                source_id: source_id.to_string(),
                rate: source.rate,
                remaining: source.frames,
                next_index: 0,
                stalls: self.stalls.get(source_id).copied().unwrap_or(0),
            })
        }

        fn native_frame_rate(&self, handle: &FakeHandle) -> Option<f64> {
            handle.rate
        }

        fn next_frame(&mut self, handle: &mut FakeHandle) -> FramePoll<(String, usize)> {
            if handle.stalls > 0 {
                handle.stalls -= 1;
                return FramePoll::Pending;
            }
            if handle.remaining == 0 {
                return FramePoll::Ended;
            }
            handle.remaining -= 1;
            handle.next_index += 1;
            FramePoll::Ready((handle.source_id.clone(), handle.next_index))
        }

        fn display(&mut self, frame: (String, usize), _placement: &Placement) -> Result<(), App> {
            self.journal.borrow_mut().displayed.push(frame);
            Ok(())
        }

        fn break_requested(&mut self) -> bool {
            self.break_after
                .is_some_and(|n| self.journal.borrow().displayed.len() >= n)
        }

        fn release(&mut self, handle: FakeHandle) {
            self.journal.borrow_mut().released.push(handle.source_id);
        }

        fn close(&mut self) {
            self.journal.borrow_mut().window_closed += 1;
        }
    }

    struct Harness {
        journal: Shared,
        controller: PlaybackController<ScriptedChannel, FakeBackend>,
    }

    fn settings(default_source: Option<&str>) -> PlayerSettings {
        PlayerSettings {
            placement: Placement {
                window_name: "test".to_string(),
                x: 0,
                y: 0,
                width: 960,
                height: 540,
            },
            default_source: default_source.map(str::to_string),
            allow_break_out: true,
            idle_sleep: Duration::from_millis(250),
        }
    }

    fn harness(
        settings: PlayerSettings,
        speedup: u32,
        sources: &[(&str, usize, Option<f64>)],
        script: Vec<Poll>,
        break_after: Option<usize>,
    ) -> Harness {
        let journal = Shared::default();
        let channel = ScriptedChannel {
            script: script.into(),
            journal: Rc::clone(&journal),
        };
        let backend = FakeBackend {
            sources: sources
                .iter()
                .map(|(id, frames, rate)| {
                    (
                        (*id).to_string(),
                        FakeSource {
                            frames: *frames,
                            rate: *rate,
                        },
                    )
                })
                .collect(),
            stalls: HashMap::new(),
            break_after,
            journal: Rc::clone(&journal),
        };
        let pacer = FramePacer::new(speedup, DEFAULT_MAX_FRAME_WAIT_MS);
        Harness {
            journal,
            controller: PlaybackController::new(settings, pacer, channel, backend),
        }
    }

    async fn drive_until_drained(controller: &mut PlaybackController<ScriptedChannel, FakeBackend>) {
        for _ in 0..10_000 {
            assert_eq!(controller.step().await, None);
            if controller.is_idle() && controller.backlog() == 0 {
                return;
            }
        }
        panic!("controller never drained its queue");
    }

    #[tokio::test(start_paused = true)]
    async fn serves_requests_in_order_then_default() {
        let mut h = harness(
            settings(Some("default.mp4")),
            1,
            &[
                ("a.mp4", 2, Some(25.0)),
                ("b.mp4", 3, Some(25.0)),
                ("default.mp4", 1, Some(25.0)),
            ],
            Vec::new(),
            None,
        );
        for token in ["a.mp4", "b.mp4", "none"] {
            assert_eq!(h.controller.handle_token(token), None);
        }
        drive_until_drained(&mut h.controller).await;

        let journal = h.journal.borrow();
        assert_eq!(journal.attempted, ["a.mp4", "b.mp4", "default.mp4"]);
        assert_eq!(journal.released, ["a.mp4", "b.mp4", "default.mp4"]);
        let sources: Vec<&str> = journal.displayed.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(
            sources,
            ["a.mp4", "a.mp4", "b.mp4", "b.mp4", "b.mp4", "default.mp4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_default_request_is_queued_once() {
        let mut h = harness(settings(Some("default.mp4")), 1, &[], Vec::new(), None);
        h.controller.handle_token("none");
        h.controller.handle_token("none");
        assert_eq!(h.controller.backlog(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_is_skipped() {
        let mut h = harness(
            settings(None),
            1,
            &[("valid.mp4", 2, Some(30.0))],
            Vec::new(),
            None,
        );
        h.controller.handle_token("missing.mp4");
        h.controller.handle_token("valid.mp4");
        drive_until_drained(&mut h.controller).await;

        let journal = h.journal.borrow();
        assert_eq!(journal.attempted, ["missing.mp4", "valid.mp4"]);
        assert_eq!(journal.released, ["valid.mp4"]);
        assert_eq!(journal.displayed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn default_request_without_default_is_dropped() {
        let mut h = harness(settings(None), 1, &[], Vec::new(), None);
        h.controller.handle_token("none");
        drive_until_drained(&mut h.controller).await;
        assert!(h.journal.borrow().attempted.is_empty());
        assert!(h.controller.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn quit_mid_playback_stops_within_one_frame() {
        let mut h = harness(
            settings(Some("long.mp4")),
            1,
            &[("long.mp4", 1000, Some(25.0))],
            vec![Poll::Nothing, Poll::Nothing, Poll::Token("exit")],
            None,
        );
        assert_eq!(h.controller.run().await, Shutdown::Quit);
        {
            let journal = h.journal.borrow();
            assert_eq!(journal.displayed.len(), 2);
            assert_eq!(journal.released, ["long.mp4"]);
            assert_eq!(journal.window_closed, 1);
            assert_eq!(journal.channel_closed, 1);
        }

        h.controller.teardown();
        assert_eq!(h.controller.step().await, Some(Shutdown::Quit));
        drop(h.controller);
        let journal = h.journal.borrow();
        assert_eq!(journal.released.len(), 1);
        assert_eq!(journal.window_closed, 1);
        assert_eq!(journal.channel_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_preempts_queued_requests() {
        let mut h = harness(
            settings(None),
            1,
            &[("a.mp4", 50, Some(25.0)), ("b.mp4", 50, Some(25.0))],
            vec![Poll::Token("a.mp4"), Poll::Token("b.mp4"), Poll::Token("exit")],
            None,
        );
        assert_eq!(h.controller.run().await, Shutdown::Quit);
        let journal = h.journal.borrow();
        assert_eq!(journal.attempted, ["a.mp4"]);
        assert_eq!(journal.released, ["a.mp4"]);
        assert_eq!(journal.channel_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_while_idle_shuts_down() {
        let mut h = harness(
            settings(None),
            1,
            &[],
            vec![Poll::Nothing, Poll::Token("exit")],
            None,
        );
        assert_eq!(h.controller.run().await, Shutdown::Quit);
        let journal = h.journal.borrow();
        assert!(journal.released.is_empty());
        assert_eq!(journal.window_closed, 1);
        assert_eq!(journal.channel_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_errors_are_treated_as_no_message() {
        let mut h = harness(
            settings(None),
            1,
            &[("a.mp4", 1, Some(25.0))],
            vec![Poll::Fail, Poll::Token("a.mp4")],
            None,
        );
        assert_eq!(h.controller.step().await, None);
        assert_eq!(h.controller.step().await, None);
        assert_eq!(h.journal.borrow().attempted, ["a.mp4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_shuts_down_mid_playback() {
        let (stop_sender, stop_receiver) = watch::channel(());
        let h = harness(
            settings(Some("long.mp4")),
            1,
            &[("long.mp4", 1000, Some(25.0))],
            Vec::new(),
            None,
        );
        let journal = h.journal;
        let mut controller = h.controller.with_stop_signal(stop_receiver);
        controller.start();
        assert_eq!(controller.step().await, None);
        stop_sender.send(()).unwrap();
        drop(stop_sender);
        assert_eq!(controller.step().await, Some(Shutdown::Signal));
        assert_eq!(journal.borrow().released, ["long.mp4"]);
        assert_eq!(journal.borrow().channel_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn break_out_honoured_only_when_allowed() {
        let mut h = harness(
            settings(Some("a.mp4")),
            1,
            &[("a.mp4", 10, Some(25.0))],
            Vec::new(),
            Some(3),
        );
        assert_eq!(h.controller.run().await, Shutdown::BreakOut);
        assert_eq!(h.journal.borrow().displayed.len(), 3);

        let mut no_break = settings(None);
        no_break.allow_break_out = false;
        let mut h = harness(no_break, 1, &[("a.mp4", 10, Some(25.0))], Vec::new(), Some(3));
        h.controller.handle_token("a.mp4");
        drive_until_drained(&mut h.controller).await;
        assert_eq!(h.journal.borrow().displayed.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_frame_rate_paces_at_fallback() {
        let mut h = harness(settings(None), 1, &[("a.mp4", 3, None)], Vec::new(), None);
        h.controller.handle_token("a.mp4");
        let started = Instant::now();
        drive_until_drained(&mut h.controller).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3 * 33), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3 * 40), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_speeds_up_pacing() {
        let mut h = harness(
            settings(None),
            4,
            &[
                ("a.mp4", 4, Some(25.0)),
                ("b.mp4", 1, Some(25.0)),
                ("c.mp4", 1, Some(25.0)),
            ],
            Vec::new(),
            None,
        );
        for token in ["a.mp4", "b.mp4", "c.mp4"] {
            h.controller.handle_token(token);
        }
        let started = Instant::now();
        // Open a.mp4, then four frames while b and c wait.
        for _ in 0..5 {
            assert_eq!(h.controller.step().await, None);
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4 * 10), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(4 * 40), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_step_sleeps_instead_of_spinning() {
        let mut h = harness(settings(None), 1, &[("a.mp4", 1, Some(25.0))], Vec::new(), None);
        let started = Instant::now();
        assert_eq!(h.controller.step().await, None);
        assert_eq!(started.elapsed(), Duration::from_millis(250));
        assert!(h.journal.borrow().attempted.is_empty());
        assert!(h.controller.is_idle());
        assert!(h.controller.waiting_announced);

        assert_eq!(h.controller.step().await, None);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert!(h.controller.waiting_announced);

        h.controller.handle_token("a.mp4");
        assert_eq!(h.controller.step().await, None);
        assert_eq!(h.journal.borrow().attempted, ["a.mp4"]);
        assert!(!h.controller.waiting_announced);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_keeps_polling_commands() {
        let mut h = harness(
            settings(Some("live.mp4")),
            1,
            &[("live.mp4", 10, Some(25.0))],
            vec![Poll::Nothing, Poll::Nothing, Poll::Token("exit")],
            None,
        );
        h.controller.backend.stalls.insert("live.mp4".to_string(), 1000);
        assert_eq!(h.controller.run().await, Shutdown::Quit);
        let journal = h.journal.borrow();
        assert!(journal.displayed.is_empty());
        assert_eq!(journal.released, ["live.mp4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_resumes_when_frames_arrive() {
        let mut h = harness(settings(None), 1, &[("a.mp4", 2, Some(25.0))], Vec::new(), None);
        h.controller.backend.stalls.insert("a.mp4".to_string(), 3);
        h.controller.handle_token("a.mp4");
        drive_until_drained(&mut h.controller).await;
        let journal = h.journal.borrow();
        assert_eq!(journal.displayed.len(), 2);
        assert_eq!(journal.released, ["a.mp4"]);
    }
}
