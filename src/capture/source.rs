// Frame source abstraction and the GStreamer screen source
//
// The capture session talks to a `FrameSource`, never to an OS capture API
// directly, so the concrete mechanism is swappable and tests can drive the
// session with a scripted source. The default implementation builds a
// GStreamer pipeline around the platform's screen source element and delivers
// already-encoded H.264 frames (plus optional AAC audio) over a channel.

use std::str::FromStr;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

/// Error type for frame source operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no screen capture element available on this platform")]
    NoCaptureElement,

    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("source is not running")]
    NotRunning,
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Capture parameters applied when a source starts or is reconfigured.
/// Changes land at the next segment rotation, never mid-segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    pub capture_audio: bool,
}

/// Negotiated stream description, fixed for the lifetime of one start
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// Caps string for the video track (byte-stream H.264)
    pub video_caps: String,
    /// Caps string for the audio track, when audio capture is on
    pub audio_caps: Option<String>,
    pub frame_rate: u32,
}

impl StreamFormat {
    pub fn has_audio(&self) -> bool {
        self.audio_caps.is_some()
    }
}

/// One encoded media frame as delivered by the source.
///
/// A frame with an empty payload is metadata-only (some capture backends emit
/// attribute updates this way); the session skips it with a rate-limited
/// warning rather than writing a zero-byte sample.
#[derive(Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    /// Presentation timestamp in nanoseconds, monotonic per start
    pub pts: u64,
    /// Duration in nanoseconds
    pub duration: u64,
    pub is_keyframe: bool,
    /// Wall clock time when the frame was captured
    pub wall_time: Instant,
}

impl EncodedFrame {
    pub fn is_metadata_only(&self) -> bool {
        self.data.is_empty()
    }
}

/// Event delivered on the frame stream
pub enum FrameEvent {
    Video(EncodedFrame),
    Audio(EncodedFrame),
    /// Asynchronous stream failure; drives the session into Recovering
    Interrupted(String),
}

/// Live stream handed out by `FrameSource::start`
pub struct FrameStream {
    pub format: StreamFormat,
    pub events: Receiver<FrameEvent>,
}

/// Tiny subsampled-luma thumbnail used by the adaptive controller to tell a
/// genuinely static screen from unattended video still playing.
#[derive(Clone, Debug)]
pub struct FrameSignature(Vec<u8>);

impl FrameSignature {
    pub fn new(luma: Vec<u8>) -> Self {
        Self(luma)
    }

    /// Mean absolute difference between two signatures, 0.0 (identical) to
    /// 255.0. Differently-sized signatures compare as maximally different.
    pub fn mean_abs_diff(&self, other: &FrameSignature) -> f64 {
        if self.0.is_empty() || self.0.len() != other.0.len() {
            return 255.0;
        }
        let sum: u64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.abs_diff(*b) as u64)
            .sum();
        sum as f64 / self.0.len() as f64
    }
}

/// Capability interface over the OS capture mechanism.
///
/// `start` establishes delivery and returns the stream; `reconfigure` applies
/// new parameters without tearing the source down. Stream failures arrive as
/// `FrameEvent::Interrupted` on the stream itself, not as callbacks.
pub trait FrameSource: Send {
    fn start(&mut self, config: &SourceConfig) -> Result<FrameStream>;

    fn reconfigure(&mut self, config: &SourceConfig) -> Result<()>;

    /// Ask the encoder to emit a keyframe so the next segment starts decodable
    fn force_keyframe(&self);

    /// Latest staticness probe, if the source supports one
    fn sample_signature(&self) -> Option<FrameSignature> {
        None
    }

    fn stop(&mut self);
}

// ============================================================================
// GStreamer screen source
// ============================================================================

/// Pick the platform screen capture element, preferring native backends
fn detect_screen_element() -> Option<&'static str> {
    const CANDIDATES: &[&str] = &[
        "d3d11screencapturesrc", // Windows
        "avfvideosrc",           // macOS
        "pipewiresrc",           // Linux Wayland
        "ximagesrc",             // Linux X11
    ];
    CANDIDATES
        .iter()
        .copied()
        .find(|name| gst::ElementFactory::find(name).is_some())
}

/// Screen capture through GStreamer.
///
/// Video: screen source -> videoconvert -> videorate -> capsfilter ->
/// tee -> x264enc -> h264parse -> appsink, with a second tee branch scaled to
/// a 32x32 thumbnail appsink for the staticness probe.
/// Audio (optional): autoaudiosrc -> audioconvert -> avenc_aac -> aacparse
/// (ADTS) -> appsink.
pub struct GstScreenSource {
    pipeline: Option<gst::Pipeline>,
    video_sink: Option<gst_app::AppSink>,
    signature_sink: Option<gst_app::AppSink>,
    rate_filter: Option<gst::Element>,
    encoder: Option<gst::Element>,
    bus_thread: Option<std::thread::JoinHandle<()>>,
}

impl GstScreenSource {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            video_sink: None,
            signature_sink: None,
            rate_filter: None,
            encoder: None,
            bus_thread: None,
        }
    }

    fn framerate_caps(frame_rate: u32) -> gst::Caps {
        gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(frame_rate.max(1) as i32, 1))
            .build()
    }

    fn build_pipeline(
        &mut self,
        config: &SourceConfig,
        tx: Sender<FrameEvent>,
    ) -> Result<StreamFormat> {
        let element_name = detect_screen_element().ok_or(SourceError::NoCaptureElement)?;
        log::info!("Using {} for screen capture", element_name);

        let pipeline = gst::Pipeline::new();

        let src = gst::ElementFactory::make(element_name)
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create {}: {}", element_name, e)))?;
        // ximagesrc damage tracking fights full-screen capture
        if element_name == "ximagesrc" {
            src.set_property("use-damage", false);
        }

        let videoconvert = make_element("videoconvert")?;
        let videorate = make_element("videorate")?;
        let rate_filter = gst::ElementFactory::make("capsfilter")
            .property("caps", Self::framerate_caps(config.frame_rate))
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;

        let tee = make_element("tee")?;

        // Encode branch
        let enc_queue = make_element("queue")?;
        let encoder = gst::ElementFactory::make("x264enc")
            .property("bitrate", config.bitrate_kbps)
            .property("key-int-max", (config.frame_rate * 2).max(1))
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create x264enc: {}", e)))?;
        encoder.set_property_from_str("tune", "zerolatency");
        encoder.set_property_from_str("speed-preset", "veryfast");

        let parser = make_element("h264parse")?;

        let video_caps = "video/x-h264,stream-format=byte-stream,alignment=au";
        let parse_filter = gst::ElementFactory::make("capsfilter")
            .property("caps", gst::Caps::from_str(video_caps).map_err(|e| {
                SourceError::Pipeline(format!("Bad video caps: {}", e))
            })?)
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;

        let video_sink = gst_app::AppSink::builder()
            .name("video_sink")
            .sync(false)
            .build();

        // Staticness probe branch: latest 32x32 luma thumbnail only
        let sig_queue = gst::ElementFactory::make("queue")
            .property_from_str("leaky", "downstream")
            .property("max-size-buffers", 1u32)
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create queue: {}", e)))?;
        let videoscale = make_element("videoscale")?;
        let sig_filter = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::builder("video/x-raw")
                    .field("format", "I420")
                    .field("width", 32i32)
                    .field("height", 32i32)
                    .build(),
            )
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;
        let signature_sink = gst_app::AppSink::builder()
            .name("signature_sink")
            .sync(false)
            .max_buffers(1)
            .drop(true)
            .build();

        pipeline
            .add_many([
                &src,
                &videoconvert,
                &videorate,
                &rate_filter,
                &tee,
                &enc_queue,
                &encoder,
                &parser,
                &parse_filter,
                video_sink.upcast_ref(),
                &sig_queue,
                &videoscale,
                &sig_filter,
                signature_sink.upcast_ref(),
            ])
            .map_err(|e| SourceError::Pipeline(format!("Failed to add elements: {}", e)))?;

        gst::Element::link_many([&src, &videoconvert, &videorate, &rate_filter, &tee])
            .map_err(|e| SourceError::Pipeline(format!("Failed to link capture chain: {}", e)))?;
        gst::Element::link_many([
            &tee,
            &enc_queue,
            &encoder,
            &parser,
            &parse_filter,
            video_sink.upcast_ref(),
        ])
        .map_err(|e| SourceError::Pipeline(format!("Failed to link encode branch: {}", e)))?;
        gst::Element::link_many([&tee, &sig_queue, &videoscale, &sig_filter, signature_sink.upcast_ref()])
            .map_err(|e| SourceError::Pipeline(format!("Failed to link probe branch: {}", e)))?;

        // Video frames -> channel. try_send keeps the streaming thread from
        // blocking on a stalled consumer; a full channel drops the frame.
        let video_tx = tx.clone();
        video_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Some(frame) = frame_from_sample(&sample) {
                        match video_tx.try_send(FrameEvent::Video(frame)) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return Err(gst::FlowError::Eos),
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        // Optional audio branch
        let audio_caps = if config.capture_audio {
            let caps = "audio/mpeg,mpegversion=4,stream-format=adts";
            match self.attach_audio_branch(&pipeline, caps, tx.clone()) {
                Ok(()) => Some(caps.to_string()),
                Err(e) => {
                    log::warn!("Audio capture unavailable, continuing video-only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // Surface pipeline errors as Interrupted events on the stream
        let bus = pipeline
            .bus()
            .ok_or_else(|| SourceError::Pipeline("Pipeline has no bus".into()))?;
        let bus_tx = tx;
        let bus_thread = std::thread::Builder::new()
            .name("hindsight-capture-bus".into())
            .spawn(move || {
                for msg in bus.iter_timed(gst::ClockTime::NONE) {
                    match msg.view() {
                        gst::MessageView::Error(err) => {
                            let detail =
                                format!("{} ({:?})", err.error(), err.debug());
                            let _ = bus_tx.send(FrameEvent::Interrupted(detail));
                            break;
                        }
                        gst::MessageView::Eos(..) => break,
                        _ => {}
                    }
                }
            })
            .map_err(|e| SourceError::Pipeline(format!("Failed to spawn bus thread: {}", e)))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::Pipeline(format!("Failed to start capture: {:?}", e)))?;

        let format = StreamFormat {
            video_caps: video_caps.to_string(),
            audio_caps,
            frame_rate: config.frame_rate,
        };

        self.video_sink = Some(video_sink);
        self.signature_sink = Some(signature_sink);
        self.rate_filter = Some(rate_filter);
        self.encoder = Some(encoder);
        self.pipeline = Some(pipeline);
        self.bus_thread = Some(bus_thread);

        Ok(format)
    }

    fn attach_audio_branch(
        &self,
        pipeline: &gst::Pipeline,
        caps: &str,
        tx: Sender<FrameEvent>,
    ) -> Result<()> {
        let src = make_element("autoaudiosrc")?;
        let convert = make_element("audioconvert")?;
        let resample = make_element("audioresample")?;
        let encoder = make_element("avenc_aac")?;
        let parser = make_element("aacparse")?;
        let filter = gst::ElementFactory::make("capsfilter")
            .property(
                "caps",
                gst::Caps::from_str(caps)
                    .map_err(|e| SourceError::Pipeline(format!("Bad audio caps: {}", e)))?,
            )
            .build()
            .map_err(|e| SourceError::Pipeline(format!("Failed to create capsfilter: {}", e)))?;
        let sink = gst_app::AppSink::builder().name("audio_sink").sync(false).build();

        pipeline
            .add_many([&src, &convert, &resample, &encoder, &parser, &filter, sink.upcast_ref()])
            .map_err(|e| SourceError::Pipeline(format!("Failed to add audio elements: {}", e)))?;
        gst::Element::link_many([&src, &convert, &resample, &encoder, &parser, &filter, sink.upcast_ref()])
            .map_err(|e| SourceError::Pipeline(format!("Failed to link audio branch: {}", e)))?;

        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Some(frame) = frame_from_sample(&sample) {
                        match tx.try_send(FrameEvent::Audio(frame)) {
                            Ok(()) | Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return Err(gst::FlowError::Eos),
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        Ok(())
    }
}

impl Default for GstScreenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for GstScreenSource {
    fn start(&mut self, config: &SourceConfig) -> Result<FrameStream> {
        self.stop();

        // Backpressure limit between the streaming thread and the session
        let (tx, rx) = bounded::<FrameEvent>(256);
        let format = self.build_pipeline(config, tx)?;

        Ok(FrameStream { format, events: rx })
    }

    fn reconfigure(&mut self, config: &SourceConfig) -> Result<()> {
        let rate_filter = self.rate_filter.as_ref().ok_or(SourceError::NotRunning)?;
        let encoder = self.encoder.as_ref().ok_or(SourceError::NotRunning)?;

        rate_filter.set_property("caps", Self::framerate_caps(config.frame_rate));
        encoder.set_property("bitrate", config.bitrate_kbps);
        log::info!(
            "Capture reconfigured: {} fps, {} kbit/s",
            config.frame_rate,
            config.bitrate_kbps
        );
        Ok(())
    }

    fn force_keyframe(&self) {
        if let Some(sink) = &self.video_sink {
            let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !sink.send_event(event) {
                log::warn!("Force-keyframe event was not handled by the encoder");
            }
        }
    }

    fn sample_signature(&self) -> Option<FrameSignature> {
        let sink = self.signature_sink.as_ref()?;
        let sample = sink.try_pull_sample(gst::ClockTime::ZERO)?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;
        // Luma plane of a 32x32 I420 thumbnail
        let luma_len = 32 * 32;
        if map.len() < luma_len {
            return None;
        }
        Some(FrameSignature::new(map[..luma_len].to_vec()))
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        self.video_sink = None;
        self.signature_sink = None;
        self.rate_filter = None;
        self.encoder = None;
        if let Some(handle) = self.bus_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GstScreenSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn make_element(name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| SourceError::Pipeline(format!("Failed to create {}: {}", name, e)))
}

/// Convert an appsink sample into an `EncodedFrame`
fn frame_from_sample(sample: &gst::Sample) -> Option<EncodedFrame> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;
    Some(EncodedFrame {
        data: map.to_vec(),
        pts: buffer.pts().map(|t| t.nseconds()).unwrap_or(0),
        duration: buffer.duration().map(|t| t.nseconds()).unwrap_or(0),
        is_keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
        wall_time: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_diff_is_zero_for_identical_frames() {
        let a = FrameSignature::new(vec![100; 1024]);
        let b = FrameSignature::new(vec![100; 1024]);
        assert_eq!(a.mean_abs_diff(&b), 0.0);
    }

    #[test]
    fn signature_diff_tracks_pixel_change() {
        let a = FrameSignature::new(vec![100; 1024]);
        let b = FrameSignature::new(vec![110; 1024]);
        assert!((a.mean_abs_diff(&b) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mismatched_signatures_compare_as_different() {
        let a = FrameSignature::new(vec![0; 16]);
        let b = FrameSignature::new(vec![0; 1024]);
        assert_eq!(a.mean_abs_diff(&b), 255.0);
    }
}
