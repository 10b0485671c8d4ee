// Rolling buffer of closed capture segments
//
// The buffer owns every finalized segment: it is the only component that may
// delete segment files. The capture session appends newly-closed segments in
// chronological order; the export path reads consistent snapshots through the
// same lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One bounded, independently-finalized slice of captured media.
///
/// A segment is open (owned by the capture session, duration is an estimate)
/// until `finalized` is set, after which it is immutable and owned by the
/// rolling buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    /// Path of the Matroska segment file
    pub path: PathBuf,
    /// Absolute wall-clock time of the first frame
    pub started_at: DateTime<Utc>,
    /// Authoritative once finalized; nominal target is `Config::segment_secs`
    /// but early termination (stop, pause, stream error) produces shorter ones
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub finalized: bool,
    pub has_audio: bool,
}

impl Segment {
    /// Wall-clock time just past the last frame
    pub fn ended_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds((self.duration_secs * 1000.0) as i64)
    }

    /// Path of the JSON metadata sidecar next to the media file
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }
}

/// Snapshot of the buffer for the UI observer
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub buffered_secs: f64,
    pub segment_count: usize,
    pub oldest_start: Option<DateTime<Utc>>,
    pub newest_end: Option<DateTime<Utc>>,
}

/// Bounded, chronologically-ordered, self-evicting set of closed segments.
pub struct RollingBuffer {
    dir: PathBuf,
    max_buffer_secs: f64,
    /// Insertion order equals chronological order
    segments: VecDeque<Segment>,
}

impl RollingBuffer {
    pub fn new(dir: PathBuf, max_buffer_secs: u32) -> Self {
        Self {
            dir,
            max_buffer_secs: max_buffer_secs as f64,
            segments: VecDeque::new(),
        }
    }

    /// Rebuild the buffer from sidecar metadata left by a previous run, so a
    /// restart does not orphan exportable history. Finalized segments are
    /// re-indexed in chronological order; media files without a sidecar (a
    /// segment that was open during a crash) are removed.
    pub fn recover(dir: PathBuf, max_buffer_secs: u32) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let mut recovered: Vec<Segment> = Vec::new();
        let mut stale: Vec<PathBuf> = Vec::new();

        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());

            match ext {
                Some("json") => {
                    let contents = match std::fs::read_to_string(&path) {
                        Ok(c) => c,
                        Err(e) => {
                            log::warn!("Unreadable segment sidecar {:?}: {}", path, e);
                            continue;
                        }
                    };
                    match serde_json::from_str::<Segment>(&contents) {
                        Ok(seg) if seg.finalized && seg.path.exists() => recovered.push(seg),
                        Ok(_) => stale.push(path),
                        Err(e) => {
                            log::warn!("Corrupt segment sidecar {:?}: {}", path, e);
                            stale.push(path);
                        }
                    }
                }
                Some("mkv") => {
                    if !path.with_extension("json").exists() {
                        stale.push(path);
                    }
                }
                _ => {}
            }
        }

        for path in stale {
            log::info!("Removing stale buffer file {:?}", path);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove stale buffer file {:?}: {}", path, e);
            }
        }

        recovered.sort_by_key(|s| s.started_at);
        if !recovered.is_empty() {
            log::info!(
                "Recovered {} buffered segments ({:.0}s)",
                recovered.len(),
                recovered.iter().map(|s| s.duration_secs).sum::<f64>()
            );
        }

        let mut buffer = Self {
            dir,
            max_buffer_secs: max_buffer_secs as f64,
            segments: recovered.into(),
        };
        buffer.evict_over_budget();
        Ok(buffer)
    }

    /// Directory holding the segment files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a newly-closed segment, then evict oldest segments until the
    /// total duration is back under budget. Returns the new buffered duration.
    ///
    /// Must be called exactly once per finalized segment, in chronological
    /// order; an out-of-order registration is logged and still appended so the
    /// on-disk file is never leaked outside the index.
    pub fn register_segment(&mut self, segment: Segment) -> f64 {
        debug_assert!(segment.finalized, "registered segment must be closed");

        if let Some(last) = self.segments.back() {
            if segment.started_at < last.started_at {
                log::warn!(
                    "Segment {} registered out of chronological order",
                    segment.id
                );
            }
        }

        if let Err(e) = write_sidecar(&segment) {
            log::warn!("Failed to write sidecar for segment {}: {}", segment.id, e);
        }

        self.segments.push_back(segment);
        self.evict_over_budget();
        self.buffered_duration()
    }

    /// Sum of closed segment durations, read without mutation
    pub fn buffered_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    /// Segments covering the most recent `duration_secs` of buffered history,
    /// oldest-first.
    ///
    /// Walks backward from the newest segment accumulating duration until the
    /// request is covered, so the result may over-select by up to one segment
    /// at the older boundary. Callers needing exact durations apply a trim in
    /// the clip composer instead of expecting per-second granularity here.
    pub fn segments_for_range(&self, duration_secs: f64) -> Vec<Segment> {
        if duration_secs >= self.buffered_duration() {
            return self.segments.iter().cloned().collect();
        }

        let mut accumulated = 0.0;
        let mut start_index = self.segments.len();
        for (i, seg) in self.segments.iter().enumerate().rev() {
            accumulated += seg.duration_secs;
            start_index = i;
            if accumulated >= duration_secs {
                break;
            }
        }

        self.segments.iter().skip(start_index).cloned().collect()
    }

    /// Segments overlapping the absolute window `[start, end)`, oldest-first.
    ///
    /// Pause gaps between segments are preserved: the result is whatever was
    /// actually captured inside the window, never synthesized filler.
    pub fn segments_for_absolute_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Segment> {
        self.segments
            .iter()
            .filter(|s| s.ended_at() > start && s.started_at < end)
            .cloned()
            .collect()
    }

    /// Delete all segments and reset to empty. Used on explicit buffer reset
    /// and on display change, where continuity across the switch cannot be
    /// guaranteed.
    pub fn clear(&mut self) {
        while let Some(seg) = self.segments.pop_front() {
            remove_segment_files(&seg);
        }
    }

    /// Apply a new duration budget, evicting immediately if needed
    pub fn set_max_duration(&mut self, max_buffer_secs: u32) {
        self.max_buffer_secs = max_buffer_secs as f64;
        self.evict_over_budget();
    }

    pub fn status(&self) -> BufferStatus {
        BufferStatus {
            buffered_secs: self.buffered_duration(),
            segment_count: self.segments.len(),
            oldest_start: self.segments.front().map(|s| s.started_at),
            newest_end: self.segments.back().map(|s| s.ended_at()),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Evict from the front until back under budget. Transient overflow of at
    /// most one segment can exist between registration and this call; it never
    /// persists past it.
    fn evict_over_budget(&mut self) {
        while self.buffered_duration() > self.max_buffer_secs && self.segments.len() > 1 {
            if let Some(oldest) = self.segments.pop_front() {
                log::debug!(
                    "Evicting segment {} ({:.1}s) from buffer",
                    oldest.id,
                    oldest.duration_secs
                );
                remove_segment_files(&oldest);
            }
        }
    }
}

fn write_sidecar(segment: &Segment) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(segment)?;
    std::fs::write(segment.sidecar_path(), json)?;
    Ok(())
}

/// Delete a segment's media file and sidecar. Filesystem failures are logged
/// and the metadata entry is dropped regardless: a leaked file is preferable
/// to an inconsistent in-memory index.
fn remove_segment_files(segment: &Segment) {
    if let Err(e) = std::fs::remove_file(&segment.path) {
        log::warn!("Failed to delete segment file {:?}: {}", segment.path, e);
    }
    let sidecar = segment.sidecar_path();
    if sidecar.exists() {
        if let Err(e) = std::fs::remove_file(&sidecar) {
            log::warn!("Failed to delete segment sidecar {:?}: {}", sidecar, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seg_at(dir: &Path, offset_secs: i64, duration_secs: f64) -> Segment {
        let id = Uuid::new_v4();
        let path = dir.join(format!("{}.mkv", id));
        std::fs::write(&path, b"media").unwrap();
        Segment {
            id,
            path,
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            duration_secs,
            size_bytes: 5,
            finalized: true,
            has_audio: false,
        }
    }

    #[test]
    fn buffered_duration_never_exceeds_budget_plus_one_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 180);

        for i in 0..10 {
            buffer.register_segment(seg_at(tmp.path(), i * 60, 60.0));
            assert!(buffer.buffered_duration() <= 180.0 + 60.0);
        }
    }

    #[test]
    fn eviction_removes_oldest_first_and_deletes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 900);

        let mut paths = Vec::new();
        for i in 0..16 {
            let seg = seg_at(tmp.path(), i * 60, 60.0);
            paths.push(seg.path.clone());
            buffer.register_segment(seg);
        }

        // 16 * 60s against a 900s budget leaves exactly 15 segments
        assert_eq!(buffer.len(), 15);
        assert!(!paths[0].exists(), "oldest segment file must be deleted");
        assert!(paths[1].exists());

        let remaining = buffer.segments_for_range(f64::INFINITY);
        assert!(remaining.windows(2).all(|w| w[0].started_at < w[1].started_at));
    }

    #[test]
    fn range_selection_returns_newest_suffix_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);
        for i in 0..10 {
            buffer.register_segment(seg_at(tmp.path(), i * 60, 60.0));
        }

        let selected = buffer.segments_for_range(300.0);
        assert_eq!(selected.len(), 5);
        // Oldest-first ordering, and exactly the newest five
        assert!(selected.windows(2).all(|w| w[0].started_at < w[1].started_at));
        let total: f64 = selected.iter().map(|s| s.duration_secs).sum();
        assert!(total >= 300.0);
        let without_oldest: f64 = selected[1..].iter().map(|s| s.duration_secs).sum();
        assert!(without_oldest < 300.0);
    }

    #[test]
    fn range_covering_everything_returns_all_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);
        for i in 0..4 {
            buffer.register_segment(seg_at(tmp.path(), i * 60, 60.0));
        }

        assert_eq!(buffer.segments_for_range(240.0).len(), 4);
        assert_eq!(buffer.segments_for_range(10_000.0).len(), 4);
    }

    #[test]
    fn over_selection_stays_within_one_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);
        for i in 0..6 {
            buffer.register_segment(seg_at(tmp.path(), i * 60, 60.0));
        }

        // 90s request: two 60s segments cover it (150s would over-select)
        let selected = buffer.segments_for_range(90.0);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn absolute_range_preserves_pause_gap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);

        let a = seg_at(tmp.path(), 0, 60.0);
        let b = seg_at(tmp.path(), 60, 60.0);
        // 300s pause gap before C
        let c = seg_at(tmp.path(), 420, 60.0);
        let (t0, t_end) = (a.started_at, c.ended_at());
        buffer.register_segment(a);
        buffer.register_segment(b);
        buffer.register_segment(c);

        let selected = buffer.segments_for_absolute_range(t0, t_end);
        assert_eq!(selected.len(), 3, "no synthesized filler, no elided gap");

        // A window entirely inside the gap selects nothing
        let gap_start = t0 + chrono::Duration::seconds(150);
        let gap_end = t0 + chrono::Duration::seconds(350);
        assert!(buffer.segments_for_absolute_range(gap_start, gap_end).is_empty());
    }

    #[test]
    fn clear_deletes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);
        let seg = seg_at(tmp.path(), 0, 60.0);
        let path = seg.path.clone();
        buffer.register_segment(seg);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.buffered_duration(), 0.0);
        assert!(!path.exists());
    }

    #[test]
    fn recover_rebuilds_index_and_removes_stale_files() {
        let tmp = tempfile::tempdir().unwrap();

        // Two finalized segments registered normally (writes sidecars)
        {
            let mut buffer = RollingBuffer::new(tmp.path().to_path_buf(), 3600);
            buffer.register_segment(seg_at(tmp.path(), 60, 60.0));
            buffer.register_segment(seg_at(tmp.path(), 0, 60.0));
        }
        // A crash-orphaned open segment: media file without sidecar
        let orphan = tmp.path().join("orphan.mkv");
        std::fs::write(&orphan, b"partial").unwrap();

        let recovered = RollingBuffer::recover(tmp.path().to_path_buf(), 3600).unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(!orphan.exists(), "orphaned open segment must be removed");

        // Chronological order restored regardless of registration order
        let all = recovered.segments_for_range(f64::INFINITY);
        assert!(all.windows(2).all(|w| w[0].started_at <= w[1].started_at));
    }
}
