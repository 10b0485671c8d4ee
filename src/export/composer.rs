// Clip composer
//
// Streams the encoded frames of each planned slice out of its segment file,
// re-timestamps them onto a single composed timeline, and muxes them into
// one output container. No decoding happens: the clip carries the exact
// frames the buffer captured. The trim point of the first slice is snapped
// outward to the nearest earlier keyframe so playback starts clean, which
// can make a clip begin up to one keyframe interval early.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::capture::segment_writer::{MatroskaSegmentWriter, SegmentSink};
use crate::capture::source::{EncodedFrame, StreamFormat};
use crate::export::{ExportError, Result, SegmentSlice};

const VIDEO_CAPS: &str = "video/x-h264,stream-format=byte-stream,alignment=au";
const AUDIO_CAPS: &str = "audio/mpeg,mpegversion=4,stream-format=adts";

/// Frames stall this long and the source pipeline is considered dead
const DEMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress callbacks are throttled to roughly this interval
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Compose the slices into `out_path`. Returns the composed duration in
/// seconds. On cancellation or failure the caller removes the partial file.
pub fn compose(
    slices: &[SegmentSlice],
    out_path: &Path,
    cancel: &AtomicBool,
    progress: &dyn Fn(f32),
) -> Result<f64> {
    // Audio is kept only when every slice carries it; a clip that silently
    // loses audio halfway through is worse than a video-only clip
    let include_audio = slices.iter().all(|s| s.segment.has_audio);

    let format = StreamFormat {
        video_caps: VIDEO_CAPS.to_string(),
        audio_caps: include_audio.then(|| AUDIO_CAPS.to_string()),
        frame_rate: 0,
    };
    let mut writer: Box<dyn SegmentSink> = Box::new(
        MatroskaSegmentWriter::open(out_path, &format)
            .map_err(|e| ExportError::CompositionFailed(e.to_string()))?,
    );

    let mut throttle = ProgressThrottle::new();
    let mut composed_ns: u64 = 0;

    for (index, slice) in slices.iter().enumerate() {
        let contributed = copy_slice(
            slice,
            writer.as_mut(),
            composed_ns,
            include_audio,
            cancel,
            &mut |within| {
                throttle.report(progress, (index as f32 + within) / slices.len() as f32);
            },
        )?;
        composed_ns += contributed;
    }

    progress(1.0);
    let finalized = writer
        .finalize()
        .map_err(|e| ExportError::CompositionFailed(e.to_string()))?;
    Ok(finalized.duration_secs)
}

struct ProgressThrottle {
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn report(&mut self, progress: &dyn Fn(f32), fraction: f32) {
        let now = Instant::now();
        let due = match self.last {
            Some(at) => now.duration_since(at) >= PROGRESS_INTERVAL,
            None => true,
        };
        if due {
            self.last = Some(now);
            progress(fraction.clamp(0.0, 1.0));
        }
    }
}

enum DemuxEvent {
    Video(EncodedFrame),
    Audio(EncodedFrame),
    VideoEos,
    AudioEos,
}

/// Copy one slice's window into the writer. Returns nanoseconds contributed
/// to the composed timeline.
fn copy_slice(
    slice: &SegmentSlice,
    writer: &mut dyn SegmentSink,
    composed_ns: u64,
    include_audio: bool,
    cancel: &AtomicBool,
    within_progress: &mut dyn FnMut(f32),
) -> Result<u64> {
    // The buffer may have evicted this segment between selection and read;
    // fail the export cleanly instead of waiting out a demux timeout
    if !slice.segment.path.exists() {
        return Err(ExportError::CompositionFailed(format!(
            "segment {:?} was evicted before it could be read",
            slice.segment.path
        )));
    }

    let in_ns = (slice.in_secs * 1e9) as u64;
    let out_ns = (slice.out_secs * 1e9) as u64;
    let window_ns = out_ns.saturating_sub(in_ns).max(1);
    let want_audio = include_audio && slice.segment.has_audio;

    let (pipeline, events) = build_demux_pipeline(&slice.segment.path, want_audio)?;
    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| ExportError::CompositionFailed(format!("failed to read segment: {:?}", e)))?;

    // Frames from the last keyframe before the in point, so the trim can
    // snap backward without producing undecodable leading deltas
    let mut preroll: Vec<EncodedFrame> = Vec::new();
    // PTS of the first frame actually written; fixed once flushing starts
    let mut origin_ns: Option<u64> = None;
    let mut last_end_ns: u64 = 0;
    let mut video_done = false;
    let mut audio_done = !want_audio;

    let result = loop {
        if cancel.load(Ordering::SeqCst) {
            break Err(ExportError::Cancelled);
        }
        if video_done && audio_done {
            break Ok(());
        }

        let event = match events.recv_timeout(DEMUX_TIMEOUT) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                break Err(ExportError::CompositionFailed(format!(
                    "segment {:?} stopped delivering frames",
                    slice.segment.path
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(ExportError::CompositionFailed(format!(
                    "segment {:?} could not be demuxed",
                    slice.segment.path
                )));
            }
        };

        match event {
            DemuxEvent::Video(frame) => {
                if video_done {
                    continue;
                }
                if frame.pts >= out_ns {
                    video_done = true;
                    continue;
                }

                if origin_ns.is_none() && frame.pts < in_ns {
                    if frame.is_keyframe {
                        preroll.clear();
                    }
                    preroll.push(frame);
                    continue;
                }

                let origin = *origin_ns.get_or_insert_with(|| {
                    preroll.first().map_or(frame.pts, |f| f.pts)
                });
                for pending in preroll.drain(..) {
                    let rel = pending.pts.saturating_sub(origin);
                    last_end_ns = rel + pending.duration;
                    write_video(writer, &pending, composed_ns + rel)?;
                }
                let rel = frame.pts.saturating_sub(origin);
                last_end_ns = rel + frame.duration;
                within_progress((frame.pts.saturating_sub(in_ns)) as f32 / window_ns as f32);
                write_video(writer, &frame, composed_ns + rel)?;
            }
            DemuxEvent::Audio(frame) => {
                if audio_done {
                    continue;
                }
                if frame.pts >= out_ns {
                    audio_done = true;
                    continue;
                }
                // Audio needs no keyframe handling; take the window as-is
                let Some(origin) = origin_ns else { continue };
                if frame.pts < origin {
                    continue;
                }
                write_audio(writer, &frame, composed_ns + (frame.pts - origin))?;
            }
            DemuxEvent::VideoEos => video_done = true,
            DemuxEvent::AudioEos => audio_done = true,
        }
    };

    let _ = pipeline.set_state(gst::State::Null);
    result?;

    if origin_ns.is_none() {
        return Err(ExportError::CompositionFailed(format!(
            "segment {:?} contained no frames in the requested window",
            slice.segment.path
        )));
    }
    Ok(last_end_ns)
}

fn write_video(writer: &mut dyn SegmentSink, frame: &EncodedFrame, pts: u64) -> Result<()> {
    let frame = EncodedFrame {
        pts,
        ..frame.clone()
    };
    writer
        .push_video(&frame)
        .map_err(|e| ExportError::CompositionFailed(e.to_string()))
}

fn write_audio(writer: &mut dyn SegmentSink, frame: &EncodedFrame, pts: u64) -> Result<()> {
    let frame = EncodedFrame {
        pts,
        ..frame.clone()
    };
    writer
        .push_audio(&frame)
        .map_err(|e| ExportError::CompositionFailed(e.to_string()))
}

/// filesrc -> matroskademux with parsed elementary streams delivered to
/// appsinks, forwarded onto one channel
fn build_demux_pipeline(
    path: &Path,
    want_audio: bool,
) -> Result<(gst::Pipeline, crossbeam_channel::Receiver<DemuxEvent>)> {
    let pipeline = gst::Pipeline::new();
    let (tx, rx) = bounded::<DemuxEvent>(256);

    let filesrc = gst::ElementFactory::make("filesrc")
        .property("location", path.to_string_lossy().as_ref())
        .build()
        .map_err(|e| ExportError::CompositionFailed(format!("failed to create filesrc: {}", e)))?;
    let demux = gst::ElementFactory::make("matroskademux")
        .build()
        .map_err(|e| {
            ExportError::CompositionFailed(format!("failed to create matroskademux: {}", e))
        })?;

    pipeline
        .add_many([&filesrc, &demux])
        .map_err(|e| ExportError::CompositionFailed(format!("failed to add elements: {}", e)))?;
    filesrc
        .link(&demux)
        .map_err(|e| ExportError::CompositionFailed(format!("failed to link demuxer: {}", e)))?;

    let video_sink = attach_track(
        &pipeline,
        "h264parse",
        VIDEO_CAPS,
        tx.clone(),
        DemuxEvent::Video,
        || DemuxEvent::VideoEos,
    )?;
    let audio_sink = if want_audio {
        Some(attach_track(
            &pipeline,
            "aacparse",
            AUDIO_CAPS,
            tx,
            DemuxEvent::Audio,
            || DemuxEvent::AudioEos,
        )?)
    } else {
        None
    };

    // Demuxer pads appear only once the container headers are read
    demux.connect_pad_added(move |_, pad| {
        let Some(caps) = pad.current_caps() else { return };
        let Some(structure) = caps.structure(0) else { return };
        let target = if structure.name().starts_with("video/") {
            Some(&video_sink)
        } else if structure.name().starts_with("audio/") {
            audio_sink.as_ref()
        } else {
            None
        };
        if let Some(parser) = target {
            let sink_pad = parser
                .static_pad("sink")
                .expect("parser elements have a sink pad");
            if let Err(e) = pad.link(&sink_pad) {
                log::warn!("Failed to link demuxer pad: {:?}", e);
            }
        }
    });

    Ok((pipeline, rx))
}

/// queue -> parser -> capsfilter -> appsink for one elementary stream;
/// returns the parser so pad-added can link the demuxer to it
fn attach_track(
    pipeline: &gst::Pipeline,
    parser_name: &str,
    caps: &str,
    tx: Sender<DemuxEvent>,
    wrap: fn(EncodedFrame) -> DemuxEvent,
    eos: fn() -> DemuxEvent,
) -> Result<gst::Element> {
    let queue = gst::ElementFactory::make("queue")
        .build()
        .map_err(|e| ExportError::CompositionFailed(format!("failed to create queue: {}", e)))?;
    let parser = gst::ElementFactory::make(parser_name)
        .build()
        .map_err(|e| {
            ExportError::CompositionFailed(format!("failed to create {}: {}", parser_name, e))
        })?;
    let filter = gst::ElementFactory::make("capsfilter")
        .property(
            "caps",
            gst::Caps::from_str(caps)
                .map_err(|e| ExportError::CompositionFailed(format!("bad caps: {}", e)))?,
        )
        .build()
        .map_err(|e| {
            ExportError::CompositionFailed(format!("failed to create capsfilter: {}", e))
        })?;
    let appsink = gst_app::AppSink::builder().sync(false).build();

    pipeline
        .add_many([&parser, &queue, &filter, appsink.upcast_ref()])
        .map_err(|e| ExportError::CompositionFailed(format!("failed to add track: {}", e)))?;
    gst::Element::link_many([&parser, &queue, &filter, appsink.upcast_ref()])
        .map_err(|e| ExportError::CompositionFailed(format!("failed to link track: {}", e)))?;

    let eos_tx = tx.clone();
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                if let Some(frame) = frame_from_sample(&sample) {
                    // Blocking send: the consumer drains at mux speed and the
                    // pipeline must not outrun it
                    match tx.send(wrap(frame)) {
                        Ok(()) => {}
                        Err(_) => return Err(gst::FlowError::Eos),
                    }
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .eos(move |_| {
                let _ = eos_tx.send(eos());
            })
            .build(),
    );

    Ok(parser)
}

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
