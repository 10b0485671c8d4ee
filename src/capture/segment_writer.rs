// Segment writers
//
// A `SegmentSink` receives the encoded frames for exactly one segment file
// and finalizes it into a playable container. The session only sees the
// trait, so rotation and eviction logic are testable with an in-memory sink;
// the real implementation muxes into Matroska through GStreamer.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::capture::source::{EncodedFrame, StreamFormat};

/// Error type for segment writing
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("writer already finalized")]
    AlreadyFinalized,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WriterError>;

/// What a finalized segment file looks like on disk
#[derive(Debug, Clone)]
pub struct FinalizedSegment {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub has_audio: bool,
}

/// One open segment file accepting frames
pub trait SegmentSink: Send {
    fn push_video(&mut self, frame: &EncodedFrame) -> Result<()>;

    fn push_audio(&mut self, frame: &EncodedFrame) -> Result<()>;

    /// Duration written so far, from normalized video timestamps
    fn written_secs(&self) -> f64;

    /// Close the container and return the finished file. Consumes the sink;
    /// a segment is finalized exactly once.
    fn finalize(self: Box<Self>) -> Result<FinalizedSegment>;

    /// Abort without producing a usable file; the partial file is removed
    fn discard(self: Box<Self>);
}

/// Opens segment sinks. The session holds a factory rather than a concrete
/// writer type so the muxing backend is swappable in tests.
pub trait SegmentSinkFactory: Send {
    fn open(&self, path: &Path, format: &StreamFormat) -> Result<Box<dyn SegmentSink>>;
}

// ============================================================================
// GStreamer Matroska writer
// ============================================================================

/// Writes one Matroska segment: appsrc -> h264parse -> matroskamux ->
/// filesink, with an optional AAC appsrc branch into the same muxer.
pub struct MatroskaSegmentWriter {
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: Option<gst_app::AppSrc>,
    path: PathBuf,
    /// PTS of the first video frame; all timestamps are normalized against it
    /// so every segment starts at zero
    pts_offset: Option<u64>,
    last_video_end: u64,
    finalized: bool,
}

impl MatroskaSegmentWriter {
    pub fn open(path: &Path, format: &StreamFormat) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let video_src = gst_app::AppSrc::builder()
            .name("video_src")
            .caps(
                &gst::Caps::from_str(&format.video_caps)
                    .map_err(|e| WriterError::Pipeline(format!("Bad video caps: {}", e)))?,
            )
            .format(gst::Format::Time)
            .build();

        let parser = make_element("h264parse")?;
        let muxer = make_element("matroskamux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().as_ref())
            .build()
            .map_err(|e| WriterError::Pipeline(format!("Failed to create filesink: {}", e)))?;

        pipeline
            .add_many([video_src.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| WriterError::Pipeline(format!("Failed to add elements: {}", e)))?;
        gst::Element::link_many([video_src.upcast_ref(), &parser, &muxer, &filesink])
            .map_err(|e| WriterError::Pipeline(format!("Failed to link video branch: {}", e)))?;

        let audio_src = match &format.audio_caps {
            Some(caps) => {
                let src = gst_app::AppSrc::builder()
                    .name("audio_src")
                    .caps(
                        &gst::Caps::from_str(caps)
                            .map_err(|e| WriterError::Pipeline(format!("Bad audio caps: {}", e)))?,
                    )
                    .format(gst::Format::Time)
                    .build();
                let aac_parser = make_element("aacparse")?;
                pipeline
                    .add_many([src.upcast_ref(), &aac_parser])
                    .map_err(|e| WriterError::Pipeline(format!("Failed to add audio elements: {}", e)))?;
                gst::Element::link_many([src.upcast_ref(), &aac_parser, &muxer])
                    .map_err(|e| WriterError::Pipeline(format!("Failed to link audio branch: {}", e)))?;
                Some(src)
            }
            None => None,
        };

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| WriterError::Pipeline(format!("Failed to start writer: {:?}", e)))?;

        Ok(Self {
            pipeline,
            video_src,
            audio_src,
            path: path.to_path_buf(),
            pts_offset: None,
            last_video_end: 0,
            finalized: false,
        })
    }

    fn push(src: &gst_app::AppSrc, frame: &EncodedFrame, pts: u64) -> Result<()> {
        let mut buffer = gst::Buffer::with_size(frame.data.len())
            .map_err(|e| WriterError::Gst(format!("Failed to allocate buffer: {}", e)))?;
        {
            let buffer = buffer.get_mut().unwrap();
            buffer
                .copy_from_slice(0, &frame.data)
                .map_err(|_| WriterError::Gst("Failed to fill buffer".into()))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(pts));
            if frame.duration > 0 {
                buffer.set_duration(gst::ClockTime::from_nseconds(frame.duration));
            }
            if !frame.is_keyframe {
                buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        src.push_buffer(buffer)
            .map_err(|e| WriterError::Gst(format!("Failed to push buffer: {:?}", e)))?;
        Ok(())
    }

    /// Normalize a source PTS onto this segment's zero-based timeline
    fn normalize(&mut self, pts: u64) -> u64 {
        let offset = *self.pts_offset.get_or_insert(pts);
        pts.saturating_sub(offset)
    }
}

impl SegmentSink for MatroskaSegmentWriter {
    fn push_video(&mut self, frame: &EncodedFrame) -> Result<()> {
        if self.finalized {
            return Err(WriterError::AlreadyFinalized);
        }
        let pts = self.normalize(frame.pts);
        self.last_video_end = pts + frame.duration;
        Self::push(&self.video_src, frame, pts)
    }

    fn push_audio(&mut self, frame: &EncodedFrame) -> Result<()> {
        if self.finalized {
            return Err(WriterError::AlreadyFinalized);
        }
        let pts = self.normalize(frame.pts);
        match &self.audio_src {
            Some(src) => Self::push(src, frame, pts),
            // Audio arriving without an audio track is dropped quietly
            None => Ok(()),
        }
    }

    fn written_secs(&self) -> f64 {
        self.last_video_end as f64 / 1_000_000_000.0
    }

    fn finalize(mut self: Box<Self>) -> Result<FinalizedSegment> {
        self.finalized = true;

        let _ = self.video_src.end_of_stream();
        if let Some(src) = &self.audio_src {
            let _ = src.end_of_stream();
        }

        // Wait for the muxer to flush the container before tearing down
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(10)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        let _ = self.pipeline.set_state(gst::State::Null);
                        return Err(WriterError::Pipeline(format!(
                            "Writer error during finalize: {}",
                            err.error()
                        )));
                    }
                    _ => {}
                }
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| WriterError::Pipeline(format!("Failed to stop writer: {:?}", e)))?;

        let size_bytes = std::fs::metadata(&self.path)?.len();
        Ok(FinalizedSegment {
            path: self.path.clone(),
            duration_secs: self.written_secs(),
            size_bytes,
            has_audio: self.audio_src.is_some(),
        })
    }

    fn discard(mut self: Box<Self>) {
        self.finalized = true;
        let _ = self.pipeline.set_state(gst::State::Null);
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove discarded segment {:?}: {}", self.path, e);
        }
    }
}

impl Drop for MatroskaSegmentWriter {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

/// Factory producing `MatroskaSegmentWriter` sinks
pub struct MatroskaSinkFactory;

impl SegmentSinkFactory for MatroskaSinkFactory {
    fn open(&self, path: &Path, format: &StreamFormat) -> Result<Box<dyn SegmentSink>> {
        Ok(Box::new(MatroskaSegmentWriter::open(path, format)?))
    }
}

fn make_element(name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(name)
        .build()
        .map_err(|e| WriterError::Pipeline(format!("Failed to create {}: {}", name, e)))
}
