// Clip export
//
// Export reads a consistent snapshot of the rolling buffer, plans which
// slice of each segment belongs in the clip, and hands the plan to the
// composer. Exactly one export runs at a time; a second request fails fast
// instead of queueing, because both would read from a buffer that is still
// rotating underneath them.

pub mod composer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::buffer::{RollingBuffer, Segment};

/// Clips shorter than this are rejected rather than produced as a
/// few-frame file nobody can use
pub const MIN_EXPORT_SECS: f64 = 1.0;

/// Error type for export operations
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("no captured content available for the requested range")]
    NoContentAvailable,

    #[error("requested clip is shorter than {MIN_EXPORT_SECS} seconds")]
    RangeTooShort,

    #[error("an export is already in progress")]
    ExportAlreadyInProgress,

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("export was cancelled")]
    Cancelled,

    #[error("clip composition failed: {0}")]
    CompositionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// A finished clip on disk
#[derive(Debug, Clone, Serialize)]
pub struct ClipDescriptor {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Wall-clock span of the captured content in the clip
    pub content_start: DateTime<Utc>,
    pub content_end: DateTime<Utc>,
}

/// The part of one segment that belongs in the clip. Offsets are seconds on
/// the segment's own zero-based timeline; the composer snaps `in_secs`
/// outward to the nearest earlier keyframe so the clip starts decodable.
#[derive(Debug, Clone)]
pub struct SegmentSlice {
    pub segment: Segment,
    pub in_secs: f64,
    pub out_secs: f64,
}

impl SegmentSlice {
    pub fn duration_secs(&self) -> f64 {
        (self.out_secs - self.in_secs).max(0.0)
    }
}

/// Slices for "the last N seconds": everything selected is kept except the
/// over-selected head of the oldest segment.
pub fn plan_last(segments: Vec<Segment>, duration_secs: f64) -> Vec<SegmentSlice> {
    let total: f64 = segments.iter().map(|s| s.duration_secs).sum();
    let mut trim_head = (total - duration_secs).max(0.0);

    segments
        .into_iter()
        .map(|segment| {
            let in_secs = trim_head.min(segment.duration_secs);
            trim_head = 0.0;
            SegmentSlice {
                out_secs: segment.duration_secs,
                segment,
                in_secs,
            }
        })
        .filter(|s| s.duration_secs() > 0.0)
        .collect()
}

/// Slices for an absolute window. Gaps between segments (pauses, recovery)
/// simply contribute nothing; the composer packs the slices back to back.
pub fn plan_range(
    segments: Vec<Segment>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<SegmentSlice> {
    segments
        .into_iter()
        .map(|segment| {
            let in_secs = (start - segment.started_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            let out_secs = ((end - segment.started_at).num_milliseconds() as f64 / 1000.0)
                .min(segment.duration_secs);
            SegmentSlice {
                segment,
                in_secs,
                out_secs,
            }
        })
        .filter(|s| s.duration_secs() > 0.0)
        .collect()
}

/// Clips are named by the moment they finished composing, matching the
/// descriptor's `created_at`
fn clip_filename(completed_at: DateTime<Utc>) -> String {
    format!("Clip {}.mkv", completed_at.format("%Y-%m-%d %H.%M.%S"))
}

/// Reset guard so a panicking or failing export never wedges the
/// single-flight gate shut
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates exports against the rolling buffer
pub struct ExportManager {
    buffer: Arc<RwLock<RollingBuffer>>,
    in_flight: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl ExportManager {
    pub fn new(buffer: Arc<RwLock<RollingBuffer>>) -> Self {
        Self {
            buffer,
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Ask the running export, if any, to stop and clean up
    pub fn cancel(&self) {
        if self.is_exporting() {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Export the most recent `duration_secs` of buffered history
    pub fn export_last(
        &self,
        duration_secs: f64,
        out_dir: &Path,
        progress: impl Fn(f32),
    ) -> Result<ClipDescriptor> {
        if duration_secs < MIN_EXPORT_SECS {
            return Err(ExportError::RangeTooShort);
        }
        let _guard = self.acquire()?;

        let segments = self.buffer.read().segments_for_range(duration_secs);
        let slices = plan_last(segments, duration_secs);
        self.run(slices, out_dir, progress)
    }

    /// Export the captured content overlapping `[start, end)`
    pub fn export_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        out_dir: &Path,
        progress: impl Fn(f32),
    ) -> Result<ClipDescriptor> {
        if (end - start).num_milliseconds() < (MIN_EXPORT_SECS * 1000.0) as i64 {
            return Err(ExportError::RangeTooShort);
        }
        let _guard = self.acquire()?;

        let segments = self.buffer.read().segments_for_absolute_range(start, end);
        let slices = plan_range(segments, start, end);
        self.run(slices, out_dir, progress)
    }

    fn acquire(&self) -> Result<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ExportError::ExportAlreadyInProgress)?;
        self.cancel.store(false, Ordering::SeqCst);
        Ok(InFlightGuard(self.in_flight.clone()))
    }

    fn run(
        &self,
        slices: Vec<SegmentSlice>,
        out_dir: &Path,
        progress: impl Fn(f32),
    ) -> Result<ClipDescriptor> {
        if slices.is_empty() {
            return Err(ExportError::NoContentAvailable);
        }

        // The request may be longer than what the buffer actually holds; the
        // floor applies to the clip that would come out, not the ask
        let planned_secs: f64 = slices.iter().map(|s| s.duration_secs()).sum();
        if planned_secs < MIN_EXPORT_SECS {
            return Err(ExportError::RangeTooShort);
        }

        std::fs::create_dir_all(out_dir)?;

        // The clip cannot be larger than the segments feeding it; refuse
        // rather than fail midway with a full disk
        let required: u64 = slices.iter().map(|s| s.segment.size_bytes).sum();
        if let Some(available) = crate::platform::available_disk_space(out_dir) {
            if available < required {
                return Err(ExportError::InsufficientDiskSpace {
                    available,
                    required,
                });
            }
        }

        // Compose under a scratch name; the clip is named by when it finished
        let work_path = out_dir.join(format!(".{}.mkv.partial", uuid::Uuid::new_v4()));

        let content_start = slices[0].segment.started_at
            + chrono::Duration::milliseconds((slices[0].in_secs * 1000.0) as i64);
        let last = slices.last().expect("slices is non-empty");
        let content_end = last.segment.started_at
            + chrono::Duration::milliseconds((last.out_secs * 1000.0) as i64);

        log::info!(
            "Exporting {} slices ({:.1}s) to {:?}",
            slices.len(),
            planned_secs,
            out_dir
        );

        let duration_secs =
            match composer::compose(&slices, &work_path, &self.cancel, &progress) {
                Ok(secs) => secs,
                Err(e) => {
                    // Never leave a half-written clip behind
                    if work_path.exists() {
                        if let Err(rm) = std::fs::remove_file(&work_path) {
                            log::warn!("Failed to remove partial export {:?}: {}", work_path, rm);
                        }
                    }
                    return Err(e);
                }
            };

        let created_at = Utc::now();
        let out_path = out_dir.join(clip_filename(created_at));
        if let Err(e) = std::fs::rename(&work_path, &out_path) {
            let _ = std::fs::remove_file(&work_path);
            return Err(e.into());
        }

        let size_bytes = std::fs::metadata(&out_path)?.len();
        log::info!("Export finished: {:?} ({} bytes)", out_path, size_bytes);

        Ok(ClipDescriptor {
            path: out_path,
            duration_secs,
            size_bytes,
            created_at,
            content_start,
            content_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn seg(offset_secs: i64, duration_secs: f64) -> Segment {
        Segment {
            id: Uuid::new_v4(),
            path: PathBuf::from(format!("/tmp/{}.mkv", offset_secs)),
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            duration_secs,
            size_bytes: 1,
            finalized: true,
            has_audio: false,
        }
    }

    #[test]
    fn plan_last_trims_only_the_oldest_segment() {
        // Five 60s segments, 270s requested: 30s trimmed from the head
        let slices = plan_last(vec![seg(0, 60.0), seg(60, 60.0), seg(120, 60.0), seg(180, 60.0), seg(240, 60.0)], 270.0);

        assert_eq!(slices.len(), 5);
        assert!((slices[0].in_secs - 30.0).abs() < 1e-9);
        assert!(slices[1..].iter().all(|s| s.in_secs == 0.0));
        let total: f64 = slices.iter().map(|s| s.duration_secs()).sum();
        assert!((total - 270.0).abs() < 1e-9);
    }

    #[test]
    fn plan_last_keeps_everything_when_request_exceeds_history() {
        let slices = plan_last(vec![seg(0, 60.0), seg(60, 60.0)], 900.0);
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.in_secs == 0.0));
    }

    #[test]
    fn plan_last_drops_fully_trimmed_segments() {
        // Request fits entirely in the newest segment
        let slices = plan_last(vec![seg(0, 60.0), seg(60, 60.0)], 20.0);
        assert_eq!(slices.len(), 1);
        assert!((slices[0].in_secs - 40.0).abs() < 1e-9);
    }

    #[test]
    fn plan_range_clamps_to_the_window() {
        let segments = vec![seg(0, 60.0), seg(60, 60.0), seg(120, 60.0)];
        let base = segments[0].started_at;
        let start = base + chrono::Duration::seconds(30);
        let end = base + chrono::Duration::seconds(150);

        let slices = plan_range(segments, start, end);
        assert_eq!(slices.len(), 3);
        assert!((slices[0].in_secs - 30.0).abs() < 1e-9);
        assert!((slices[0].out_secs - 60.0).abs() < 1e-9);
        assert_eq!(slices[1].in_secs, 0.0);
        assert!((slices[2].out_secs - 30.0).abs() < 1e-9);

        let total: f64 = slices.iter().map(|s| s.duration_secs()).sum();
        assert!((total - 120.0).abs() < 1e-9);
    }

    #[test]
    fn plan_range_packs_across_a_pause_gap() {
        // 60s segment, 300s gap, 60s segment
        let segments = vec![seg(0, 60.0), seg(360, 60.0)];
        let base = segments[0].started_at;
        let start = base;
        let end = base + chrono::Duration::seconds(420);

        let slices = plan_range(segments, start, end);
        assert_eq!(slices.len(), 2);
        // Captured content only: 120s, not 420s of wall time
        let total: f64 = slices.iter().map(|s| s.duration_secs()).sum();
        assert!((total - 120.0).abs() < 1e-9);
    }

    #[test]
    fn second_export_fails_fast_while_one_is_running() {
        let tmp = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RwLock::new(RollingBuffer::new(
            tmp.path().to_path_buf(),
            3600,
        )));
        let manager = ExportManager::new(buffer);

        let _guard = manager.acquire().unwrap();
        assert!(manager.is_exporting());
        assert!(matches!(
            manager.acquire(),
            Err(ExportError::ExportAlreadyInProgress)
        ));
    }

    #[test]
    fn gate_reopens_after_an_export_ends() {
        let tmp = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RwLock::new(RollingBuffer::new(
            tmp.path().to_path_buf(),
            3600,
        )));
        let manager = ExportManager::new(buffer);

        drop(manager.acquire().unwrap());
        assert!(!manager.is_exporting());
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn empty_buffer_reports_no_content() {
        let tmp = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RwLock::new(RollingBuffer::new(
            tmp.path().to_path_buf(),
            3600,
        )));
        let manager = ExportManager::new(buffer);

        let result = manager.export_last(30.0, tmp.path(), |_| {});
        assert!(matches!(result, Err(ExportError::NoContentAvailable)));
    }

    #[test]
    fn sub_second_requests_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RwLock::new(RollingBuffer::new(
            tmp.path().to_path_buf(),
            3600,
        )));
        let manager = ExportManager::new(buffer);

        assert!(matches!(
            manager.export_last(0.25, tmp.path(), |_| {}),
            Err(ExportError::RangeTooShort)
        ));
    }

    #[test]
    fn thin_buffer_cannot_yield_a_sub_second_clip() {
        let tmp = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RwLock::new(RollingBuffer::new(
            tmp.path().to_path_buf(),
            3600,
        )));
        {
            let id = Uuid::new_v4();
            let path = tmp.path().join(format!("{}.mkv", id));
            std::fs::write(&path, b"media").unwrap();
            buffer.write().register_segment(Segment {
                id,
                path,
                started_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
                duration_secs: 0.5,
                size_bytes: 5,
                finalized: true,
                has_audio: false,
            });
        }
        let manager = ExportManager::new(buffer);

        // The request is well over the floor; the half second of history
        // that would actually come out is not
        assert!(matches!(
            manager.export_last(30.0, tmp.path(), |_| {}),
            Err(ExportError::RangeTooShort)
        ));
    }

    #[test]
    fn clip_filename_derives_from_completion_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 5).unwrap();
        assert_eq!(clip_filename(at), "Clip 2026-03-01 09.30.05.mkv");
    }
}
