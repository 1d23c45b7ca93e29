use crate::error::App;
use crate::player::backend::{FramePoll, Placement, RenderBackend};
use gstreamer::prelude::*;
use gstreamer::{ClockTime, MessageView, Pipeline, Sample, State};
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::prelude::*;
use gstreamer_video::VideoOverlay;
use log::{debug, error, info, warn};
use std::path::Path;

const PREROLL_TIMEOUT: ClockTime = ClockTime::from_seconds(10);
/// Total time without a decoded frame before a source is abandoned.
const STALL_LIMIT: ClockTime = ClockTime::from_seconds(5);
const FRAME_FORMAT: &str = "BGRx";

/// Per-source decode pipeline.
pub struct Decoder {
    pipeline: Pipeline,
    sink: AppSink,
    frame_rate: Option<f64>,
    stalled: ClockTime,
}

/// Persistent output window fed through an `appsrc`.
struct Display {
    pipeline: Pipeline,
    source: AppSrc,
    overlay_applied: bool,
}

pub struct GstBackend {
    display: Option<Display>,
    break_pending: bool,
    pull_timeout: ClockTime,
}

impl GstBackend {
    /// A single frame pull never blocks longer than `max_frame_wait_ms`.
    pub fn new(max_frame_wait_ms: u64) -> Result<Self, App> {
        gstreamer::init()?;
        info!("GStreamer initialized successfully.");
        Ok(Self {
            display: None,
            break_pending: false,
            pull_timeout: pull_timeout(max_frame_wait_ms),
        })
    }

    fn display_for(&mut self, placement: &Placement) -> Result<&mut Display, App> {
        if self.display.is_none() {
            self.display = Some(build_display(placement)?);
        }
        self.display
            .as_mut()
            .ok_or_else(|| App::Pipeline("Display pipeline missing".to_string()))
    }
}

impl RenderBackend for GstBackend {
    type Handle = Decoder;
    type Frame = Sample;

    fn open(&mut self, source_id: &str, placement: &Placement) -> Result<Decoder, App> {
        let uri = source_uri(source_id)?;
        let decoder = build_decoder(&uri, placement)
            .map_err(|e| App::source_open(source_id, e.to_string()))?;
        let started = preroll(&decoder.pipeline).and_then(|()| {
            decoder
                .pipeline
                .set_state(State::Playing)
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        if let Err(reason) = started {
            let _ = decoder.pipeline.set_state(State::Null);
            return Err(App::source_open(source_id, reason));
        }

        let frame_rate = negotiated_frame_rate(&decoder.sink);
        Ok(Decoder {
            frame_rate,
            ..decoder
        })
    }

    fn native_frame_rate(&self, handle: &Decoder) -> Option<f64> {
        handle.frame_rate
    }

    fn next_frame(&mut self, handle: &mut Decoder) -> FramePoll<Sample> {
        if handle.sink.is_eos() {
            return FramePoll::Ended;
        }
        if let Some(sample) = handle.sink.try_pull_sample(self.pull_timeout) {
            handle.stalled = ClockTime::ZERO;
            return FramePoll::Ready(sample);
        }
        if handle.sink.is_eos() {
            return FramePoll::Ended;
        }
        if let Some(reason) = pending_error(&handle.pipeline) {
            error!("Error from GStreamer pipeline: {}", reason);
            return FramePoll::Ended;
        }
        if stall_exceeded(&mut handle.stalled, self.pull_timeout) {
            warn!("No frame decoded within {}, ending source", STALL_LIMIT);
            return FramePoll::Ended;
        }
        debug!("No frame yet after {}", handle.stalled);
        FramePoll::Pending
    }

    fn display(&mut self, frame: Sample, placement: &Placement) -> Result<(), App> {
        let display = self.display_for(placement)?;
        let buffer = frame
            .buffer_owned()
            .ok_or_else(|| App::Pipeline("Sample carried no buffer".to_string()))?;
        if let Some(caps) = frame.caps() {
            if display.source.caps().as_deref() != Some(caps) {
                display.source.set_caps(Some(&caps.to_owned()));
            }
        }
        display
            .source
            .push_buffer(buffer)
            .map_err(|e| App::Pipeline(format!("Failed to push frame to window: {e:?}")))?;

        if !display.overlay_applied {
            display.overlay_applied = true;
            apply_placement(&display.pipeline, placement);
        }
        if drain_display_bus(&display.pipeline) {
            self.break_pending = true;
        }
        Ok(())
    }

    fn break_requested(&mut self) -> bool {
        std::mem::take(&mut self.break_pending)
    }

    fn release(&mut self, handle: Decoder) {
        if let Err(e) = handle.pipeline.set_state(State::Null) {
            error!("Failed to stop decode pipeline: {}", e);
        }
    }

    fn close(&mut self) {
        if let Some(display) = self.display.take() {
            let _ = display.source.end_of_stream();
            if let Err(e) = display.pipeline.set_state(State::Null) {
                error!("Failed to close display window: {}", e);
            }
        }
    }
}

fn pull_timeout(max_frame_wait_ms: u64) -> ClockTime {
    ClockTime::from_mseconds(max_frame_wait_ms.max(1)).min(STALL_LIMIT)
}

/// Adds one timed-out pull to `stalled`; true once the stall limit is reached.
fn stall_exceeded(stalled: &mut ClockTime, pull_timeout: ClockTime) -> bool {
    *stalled = stalled.saturating_add(pull_timeout);
    *stalled >= STALL_LIMIT
}

fn source_uri(source_id: &str) -> Result<String, App> {
    if source_id.contains("://") {
        return Ok(source_id.to_string());
    }
    let path = Path::new(source_id)
        .canonicalize()
        .map_err(|e| App::source_open(source_id, e.to_string()))?;
    glib::filename_to_uri(&path, None)
        .map(|uri| uri.to_string())
        .map_err(|e| App::source_open(source_id, e.to_string()))
}

fn frame_caps(placement: &Placement) -> gstreamer::Caps {
    gstreamer::Caps::builder("video/x-raw")
        .field("format", FRAME_FORMAT)
        .field("width", i32::try_from(placement.width).unwrap_or(i32::MAX))
        .field("height", i32::try_from(placement.height).unwrap_or(i32::MAX))
        .build()
}

fn build_decoder(uri: &str, placement: &Placement) -> Result<Decoder, App> {
    let pipeline = Pipeline::new();
    let source = gstreamer::ElementFactory::make("uridecodebin")
        .property("uri", uri)
        .build()
        .map_err(|_| App::Element("Failed to create uridecodebin element".to_string()))?;
    let convert = gstreamer::ElementFactory::make("videoconvert")
        .build()
        .map_err(|_| App::Element("Failed to create videoconvert element".to_string()))?;
    let scale = gstreamer::ElementFactory::make("videoscale")
        .build()
        .map_err(|_| App::Element("Failed to create videoscale element".to_string()))?;
    let sink = AppSink::builder()
        .caps(&frame_caps(placement))
        .max_buffers(2)
        .sync(false)
        .build();

    pipeline
        .add_many([&source, &convert, &scale, sink.upcast_ref()])
        .map_err(|_| App::Pipeline("Failed to add elements to pipeline".to_string()))?;
    gstreamer::Element::link_many([&convert, &scale, sink.upcast_ref()])
        .map_err(|_| App::Pipeline("Failed to link video elements".to_string()))?;

    let pipeline_weak = pipeline.downgrade();
    let convert_weak = convert.downgrade();
    source.connect_pad_added(move |_, src_pad| {
        let (Some(pipeline), Some(convert)) = (pipeline_weak.upgrade(), convert_weak.upgrade())
        else {
            error!("Failed to upgrade pipeline reference");
            return;
        };
        let is_video = src_pad
            .current_caps()
            .and_then(|caps| {
                caps.structure(0)
                    .map(|s| s.name().as_str().starts_with("video/"))
            })
            .unwrap_or(false);

        let result = if is_video {
            link_video_pad(src_pad, &convert)
        } else {
            discard_pad(&pipeline, src_pad)
        };
        if let Err(e) = result {
            error!("{}", e);
        }
    });

    Ok(Decoder {
        pipeline,
        sink,
        frame_rate: None,
        stalled: ClockTime::ZERO,
    })
}

fn link_video_pad(src_pad: &gstreamer::Pad, convert: &gstreamer::Element) -> Result<(), App> {
    let sink_pad = convert
        .static_pad("sink")
        .ok_or_else(|| App::Pipeline("videoconvert has no sink pad".to_string()))?;
    if sink_pad.is_linked() {
        debug!("Ignoring additional video stream");
        return Ok(());
    }
    src_pad
        .link(&sink_pad)
        .map_err(|e| App::Pipeline(format!("Failed to link video stream: {e:?}")))?;
    Ok(())
}

fn discard_pad(pipeline: &Pipeline, src_pad: &gstreamer::Pad) -> Result<(), App> {
    let fakesink = gstreamer::ElementFactory::make("fakesink")
        .property("sync", false)
        .build()
        .map_err(|_| App::Element("Failed to create fakesink element".to_string()))?;
    pipeline
        .add(&fakesink)
        .map_err(|_| App::Pipeline("Failed to add fakesink to pipeline".to_string()))?;
    fakesink
        .sync_state_with_parent()
        .map_err(|_| App::State("Failed to sync fakesink state".to_string()))?;
    let sink_pad = fakesink
        .static_pad("sink")
        .ok_or_else(|| App::Pipeline("fakesink has no sink pad".to_string()))?;
    src_pad
        .link(&sink_pad)
        .map_err(|e| App::Pipeline(format!("Failed to link non-video stream: {e:?}")))?;
    Ok(())
}

/// Brings the pipeline to PAUSED so caps are negotiated and the first frame
/// is queued. Returns the failure reason if the source cannot be decoded.
fn preroll(pipeline: &Pipeline) -> Result<(), String> {
    pipeline
        .set_state(State::Paused)
        .map_err(|_| pending_error(pipeline).unwrap_or_else(|| "failed to start".to_string()))?;
    let (result, _, _) = pipeline.state(PREROLL_TIMEOUT);
    result.map_err(|_| pending_error(pipeline).unwrap_or_else(|| "failed to preroll".to_string()))?;
    match pending_error(pipeline) {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

fn pending_error(pipeline: &Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
    match msg.view() {
        MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

fn negotiated_frame_rate(sink: &AppSink) -> Option<f64> {
    let caps = sink.static_pad("sink")?.current_caps()?;
    let fraction = caps
        .structure(0)?
        .get::<gstreamer::Fraction>("framerate")
        .ok()?;
    if fraction.denom() == 0 {
        return None;
    }
    Some(f64::from(fraction.numer()) / f64::from(fraction.denom()))
}

fn build_display(placement: &Placement) -> Result<Display, App> {
    let pipeline = Pipeline::with_name(&placement.window_name);
    let source = AppSrc::builder()
        .caps(&frame_caps(placement))
        .format(gstreamer::Format::Time)
        .is_live(true)
        .do_timestamp(true)
        .build();
    let convert = gstreamer::ElementFactory::make("videoconvert")
        .build()
        .map_err(|_| App::Element("Failed to create videoconvert element".to_string()))?;
    let sink = gstreamer::ElementFactory::make("autovideosink")
        .build()
        .map_err(|_| App::Element("Failed to create autovideosink element".to_string()))?;

    pipeline
        .add_many([source.upcast_ref(), &convert, &sink])
        .map_err(|_| App::Pipeline("Failed to add elements to display pipeline".to_string()))?;
    gstreamer::Element::link_many([source.upcast_ref(), &convert, &sink])
        .map_err(|_| App::Pipeline("Failed to link display elements".to_string()))?;

    pipeline
        .set_state(State::Playing)
        .map_err(|_| App::State("Failed to set display pipeline to Playing".to_string()))?;

    let mut tags = gstreamer::TagList::new();
    if let Some(tags) = tags.get_mut() {
        tags.add::<gstreamer::tags::Title>(
            &placement.window_name.as_str(),
            gstreamer::TagMergeMode::Replace,
        );
    }
    if !source.send_event(gstreamer::event::Tag::new(tags)) {
        debug!("Window title tag was not accepted");
    }

    info!("Opened window {}", placement.window_name);
    Ok(Display {
        pipeline,
        source,
        overlay_applied: false,
    })
}

/// Positions the video inside the sink's window when the sink supports it.
fn apply_placement(pipeline: &Pipeline, placement: &Placement) {
    let Some(element) = pipeline.by_interface(VideoOverlay::static_type()) else {
        debug!("Video sink has no overlay support, keeping default placement");
        return;
    };
    let Ok(overlay) = element.dynamic_cast::<VideoOverlay>() else {
        return;
    };
    let width = i32::try_from(placement.width).unwrap_or(i32::MAX);
    let height = i32::try_from(placement.height).unwrap_or(i32::MAX);
    if let Err(e) = overlay.set_render_rectangle(placement.x, placement.y, width, height) {
        debug!("Could not set render rectangle: {}", e);
    }
}

/// Empties the window's bus. Returns whether Escape was pressed.
fn drain_display_bus(pipeline: &Pipeline) -> bool {
    let Some(bus) = pipeline.bus() else {
        return false;
    };
    let mut escape_pressed = false;
    while let Some(msg) = bus.pop() {
        match msg.view() {
            MessageView::Element(element) => {
                if element.structure().is_some_and(is_escape_key_press) {
                    escape_pressed = true;
                }
            }
            MessageView::Error(err) => {
                error!("Error from display pipeline: {}", err.error());
            }
            _ => (),
        }
    }
    escape_pressed
}

fn is_escape_key_press(structure: &gstreamer::StructureRef) -> bool {
    if structure.name().as_str() != "GstNavigationMessage" {
        return false;
    }
    let Ok(event) = structure.get::<gstreamer::Event>("event") else {
        return false;
    };
    event.structure().is_some_and(|s| {
        s.get::<&str>("event").is_ok_and(|kind| kind == "key-press")
            && s.get::<&str>("key").is_ok_and(|key| key == "Escape")
    })
}
