// Capture session
//
// One session owns the frame source, the currently-open segment sink, and the
// rotation schedule. It runs on a dedicated thread: frames and commands are
// multiplexed with crossbeam `select!`, segment finalization is offloaded to a
// single ordered worker so muxer flushing never stalls frame intake or
// reorders buffer registration, and stream failures are retried with bounded
// exponential backoff before the session gives up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::buffer::{RollingBuffer, Segment};
use crate::capture::adaptive::{AdaptiveController, RateTarget};
use crate::capture::segment_writer::{SegmentSink, SegmentSinkFactory};
use crate::capture::source::{FrameEvent, FrameSource, FrameStream, SourceConfig, SourceError};
use crate::capture::{CaptureError, CaptureObserver, CaptureState, CaptureStatus};
use crate::config::Config;

/// How often the loop wakes without frames to run housekeeping
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Recovery backoff: 1s doubling per attempt, capped
const RECOVERY_BASE_DELAY: Duration = Duration::from_secs(1);
const RECOVERY_MAX_DELAY: Duration = Duration::from_secs(30);
const RECOVERY_MAX_ATTEMPTS: u32 = 5;

/// Minimum spacing between repeated warnings of the same kind
const WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Capture parameters the session needs, snapshotted from `Config`
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub segment_secs: u32,
    pub frame_rate: u32,
    pub idle_frame_rate: u32,
    pub bitrate_kbps: u32,
    pub capture_audio: bool,
    pub adaptive: bool,
    pub idle_threshold_secs: u32,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            segment_secs: config.segment_secs.max(1),
            frame_rate: config.frame_rate.max(1),
            idle_frame_rate: config.idle_frame_rate.max(1),
            bitrate_kbps: config.quality.bitrate_kbps(),
            capture_audio: config.capture_audio,
            adaptive: config.adaptive_frame_rate,
            idle_threshold_secs: config.idle_threshold_secs,
        }
    }
}

impl SessionConfig {
    fn source_config(&self, rate: RateTarget) -> SourceConfig {
        SourceConfig {
            frame_rate: match rate {
                RateTarget::Full => self.frame_rate,
                RateTarget::Idle => self.idle_frame_rate,
            },
            bitrate_kbps: self.bitrate_kbps,
            capture_audio: self.capture_audio,
        }
    }
}

/// Commands accepted by a running session
pub enum SessionCommand {
    /// System going to sleep: close the open segment, keep history
    Pause,
    /// System awake again: reopen delivery with a fresh segment
    Resume,
    /// Display layout changed: buffered history is no longer coherent
    DisplayChanged,
    /// New settings; capture parameters land at the next rotation
    UpdateConfig(SessionConfig),
    Stop,
}

/// Control handle for a running capture session
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
    state: Arc<RwLock<CaptureState>>,
}

impl SessionHandle {
    pub fn state(&self) -> CaptureState {
        self.state.read().clone()
    }

    pub fn send(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }

    /// Request shutdown and wait for the final segment to be registered
    pub fn stop(mut self) {
        let _ = self.commands.send(SessionCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Segment currently receiving frames
struct OpenSegment {
    sink: Box<dyn SegmentSink>,
    id: Uuid,
    started_at: DateTime<Utc>,
}

struct WarnLimiter {
    last: Option<Instant>,
}

impl WarnLimiter {
    fn new() -> Self {
        Self { last: None }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(at) if now.duration_since(at) < WARN_INTERVAL => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

pub struct CaptureSession {
    config: SessionConfig,
    pending_config: Option<SessionConfig>,
    source: Box<dyn FrameSource>,
    sink_factory: Box<dyn SegmentSinkFactory>,
    buffer: Arc<RwLock<RollingBuffer>>,
    observer: Arc<dyn CaptureObserver>,
    idle_probe: Box<dyn Fn() -> Duration + Send>,
    state: Arc<RwLock<CaptureState>>,
    commands: Receiver<SessionCommand>,

    stream: Option<FrameStream>,
    open: Option<OpenSegment>,
    adaptive: AdaptiveController,
    current_rate: RateTarget,
    pending_rate: Option<RateTarget>,
    keyframe_requested: bool,
    stopped: bool,
    finalize_tx: Option<Sender<OpenSegment>>,
    finalize_worker: Option<std::thread::JoinHandle<()>>,
    frame_warn: WarnLimiter,
    write_warn: WarnLimiter,
}

impl CaptureSession {
    /// Start capturing on a dedicated thread. Fails synchronously if consent
    /// is missing or the first stream cannot be established, so the caller
    /// gets a direct error rather than an event.
    pub fn spawn(
        config: SessionConfig,
        mut source: Box<dyn FrameSource>,
        sink_factory: Box<dyn SegmentSinkFactory>,
        buffer: Arc<RwLock<RollingBuffer>>,
        observer: Arc<dyn CaptureObserver>,
        idle_probe: Box<dyn Fn() -> Duration + Send>,
        permission_probe: Box<dyn Fn() -> bool + Send>,
    ) -> Result<SessionHandle, CaptureError> {
        // Consent is consulted before anything touches the capture backend;
        // a denial here never reaches the pipeline
        if !permission_probe() {
            return Err(CaptureError::PermissionDenied);
        }

        let state = Arc::new(RwLock::new(CaptureState {
            status: CaptureStatus::Starting,
            started_at: Some(Utc::now()),
            buffered_secs: buffer.read().buffered_duration(),
            active_frame_rate: config.frame_rate,
        }));
        observer.state_changed(&state.read());

        let stream = source
            .start(&config.source_config(RateTarget::Full))
            .map_err(map_source_error)?;

        let (tx, rx) = unbounded();
        let idle_threshold = Duration::from_secs(config.idle_threshold_secs as u64);
        let (finalize_tx, finalize_worker) =
            Self::spawn_finalize_worker(buffer.clone(), observer.clone(), state.clone())?;

        let mut session = Self {
            adaptive: AdaptiveController::new(idle_threshold),
            config,
            pending_config: None,
            source,
            sink_factory,
            buffer,
            observer,
            idle_probe,
            state: state.clone(),
            commands: rx,
            stream: Some(stream),
            open: None,
            current_rate: RateTarget::Full,
            pending_rate: None,
            keyframe_requested: false,
            stopped: false,
            finalize_tx: Some(finalize_tx),
            finalize_worker: Some(finalize_worker),
            frame_warn: WarnLimiter::new(),
            write_warn: WarnLimiter::new(),
        };

        let thread = std::thread::Builder::new()
            .name("hindsight-capture".into())
            .spawn(move || session.run())?;

        Ok(SessionHandle {
            commands: tx,
            thread: Some(thread),
            state,
        })
    }

    fn run(&mut self) {
        if let Err(e) = self.open_segment() {
            self.fail(e);
            return;
        }
        self.set_status(CaptureStatus::Active);

        loop {
            let event = match &self.stream {
                Some(stream) => {
                    crossbeam_channel::select! {
                        recv(self.commands) -> cmd => match cmd {
                            Ok(cmd) => Loop::Command(cmd),
                            Err(_) => Loop::Command(SessionCommand::Stop),
                        },
                        recv(stream.events) -> ev => match ev {
                            Ok(ev) => Loop::Frame(ev),
                            // Source dropped its sender without an error event
                            Err(_) => Loop::Frame(FrameEvent::Interrupted(
                                "frame delivery ended unexpectedly".into(),
                            )),
                        },
                        default(TICK_INTERVAL) => Loop::Tick,
                    }
                }
                // Paused: only commands can wake us
                None => match self.commands.recv_timeout(TICK_INTERVAL) {
                    Ok(cmd) => Loop::Command(cmd),
                    Err(RecvTimeoutError::Timeout) => Loop::Tick,
                    Err(RecvTimeoutError::Disconnected) => Loop::Command(SessionCommand::Stop),
                },
            };

            match event {
                Loop::Command(SessionCommand::Stop) => break,
                Loop::Command(cmd) => self.handle_command(cmd),
                Loop::Frame(ev) => self.handle_frame(ev),
                Loop::Tick => self.tick(),
            }

            // A fatal recovery failure (or a Stop received during backoff)
            // shuts the session down from inside a handler
            if self.stopped {
                return;
            }
        }

        self.shutdown();
    }

    // ========================================================================
    // Frame handling and rotation
    // ========================================================================

    fn handle_frame(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Video(frame) => {
                if frame.is_metadata_only() {
                    if self.frame_warn.allow() {
                        log::warn!("Skipping metadata-only frame from capture source");
                    }
                    return;
                }

                if self.rotation_due() {
                    if frame.is_keyframe {
                        self.rotate();
                    } else if !self.keyframe_requested {
                        // Rotate only on a keyframe so every segment starts
                        // independently decodable
                        self.source.force_keyframe();
                        self.keyframe_requested = true;
                    }
                }

                if let Some(open) = &mut self.open {
                    if let Err(e) = open.sink.push_video(&frame) {
                        if self.write_warn.allow() {
                            log::warn!("Failed to write video frame: {}", e);
                            self.observer.warning(&format!("frame write failed: {}", e));
                        }
                    }
                }
            }
            FrameEvent::Audio(frame) => {
                if let Some(open) = &mut self.open {
                    if let Err(e) = open.sink.push_audio(&frame) {
                        if self.write_warn.allow() {
                            log::warn!("Failed to write audio frame: {}", e);
                        }
                    }
                }
            }
            FrameEvent::Interrupted(reason) => self.recover(reason),
        }
    }

    fn rotation_due(&self) -> bool {
        match &self.open {
            Some(open) => open.sink.written_secs() >= self.config.segment_secs as f64,
            None => false,
        }
    }

    /// Close the current segment and start the next one. The next sink is
    /// opened before the previous one is finalized, so a finalize stall never
    /// leaves capture without a destination.
    fn rotate(&mut self) {
        self.keyframe_requested = false;

        if let Some(config) = self.pending_config.take() {
            self.apply_config(config);
        }
        if let Some(rate) = self.pending_rate.take() {
            self.apply_rate(rate);
        }

        let next = match self.open_sink() {
            Ok(next) => next,
            Err(e) => {
                // No destination for new frames; treat like a stream failure
                let previous = self.open.take();
                if let Some(previous) = previous {
                    self.enqueue_finalize(previous);
                }
                self.recover(format!("segment rotation failed: {}", e));
                return;
            }
        };

        let previous = self.open.replace(next);
        if let Some(previous) = previous {
            self.enqueue_finalize(previous);
        }
    }

    fn open_segment(&mut self) -> Result<(), CaptureError> {
        let open = self
            .open_sink()
            .map_err(|e| CaptureError::StreamSetupFailed(e.to_string()))?;
        self.open = Some(open);
        Ok(())
    }

    fn open_sink(&mut self) -> Result<OpenSegment, crate::capture::segment_writer::WriterError> {
        let stream = self.stream.as_ref().ok_or_else(|| {
            crate::capture::segment_writer::WriterError::Pipeline("no active stream".into())
        })?;
        let id = Uuid::new_v4();
        let path = self.buffer.read().dir().join(format!("{}.mkv", id));
        let sink = self.sink_factory.open(&path, &stream.format)?;
        Ok(OpenSegment {
            sink,
            id,
            started_at: Utc::now(),
        })
    }

    /// Hand a closed segment to the finalize worker. The worker drains its
    /// queue in order, so registration stays chronological even when one
    /// muxer flush is much slower than the next.
    fn enqueue_finalize(&mut self, open: OpenSegment) {
        match &self.finalize_tx {
            Some(tx) => {
                if tx.send(open).is_err() {
                    log::error!("Finalize worker exited unexpectedly; segment dropped");
                }
            }
            None => log::error!("Finalize worker is not running; segment dropped"),
        }
    }

    /// One worker finalizes segments strictly in hand-off order; a slow flush
    /// delays later registrations instead of racing past them
    fn spawn_finalize_worker(
        buffer: Arc<RwLock<RollingBuffer>>,
        observer: Arc<dyn CaptureObserver>,
        state: Arc<RwLock<CaptureState>>,
    ) -> std::io::Result<(Sender<OpenSegment>, std::thread::JoinHandle<()>)> {
        let (tx, rx) = unbounded::<OpenSegment>();
        let worker = std::thread::Builder::new()
            .name("hindsight-finalize".into())
            .spawn(move || {
                for open in rx {
                    match open.sink.finalize() {
                        Ok(file) => {
                            let segment = Segment {
                                id: open.id,
                                path: file.path,
                                started_at: open.started_at,
                                duration_secs: file.duration_secs,
                                size_bytes: file.size_bytes,
                                finalized: true,
                                has_audio: file.has_audio,
                            };
                            let buffered = buffer.write().register_segment(segment);
                            state.write().buffered_secs = buffered;
                            observer.buffered_duration_changed(buffered);
                        }
                        Err(e) => {
                            log::warn!("Failed to finalize segment {}: {}", open.id, e);
                            observer.warning(&format!("segment finalize failed: {}", e));
                        }
                    }
                }
            })?;
        Ok((tx, worker))
    }

    /// Wait for every queued finalize to land, then bring the worker back up.
    /// Used before destructive buffer operations so a queued registration
    /// cannot resurrect history the caller is about to drop.
    fn drain_finalizers(&mut self) {
        if let Some(tx) = self.finalize_tx.take() {
            drop(tx);
        }
        if let Some(worker) = self.finalize_worker.take() {
            let _ = worker.join();
        }
        match Self::spawn_finalize_worker(
            self.buffer.clone(),
            self.observer.clone(),
            self.state.clone(),
        ) {
            Ok((tx, worker)) => {
                self.finalize_tx = Some(tx);
                self.finalize_worker = Some(worker);
            }
            Err(e) => log::error!("Failed to restart finalize worker: {}", e),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Pause => self.pause(),
            SessionCommand::Resume => self.resume(),
            SessionCommand::DisplayChanged => self.display_changed(),
            SessionCommand::UpdateConfig(config) => {
                // Takes effect at the next rotation, never mid-segment
                self.pending_config = Some(config);
            }
            SessionCommand::Stop => unreachable!("Stop is handled by the run loop"),
        }
    }

    fn pause(&mut self) {
        if self.stream.is_none() {
            return;
        }
        log::info!("Capture pausing");
        if let Some(open) = self.open.take() {
            self.enqueue_finalize(open);
        }
        self.source.stop();
        self.stream = None;
        self.set_status(CaptureStatus::Paused);
    }

    fn resume(&mut self) {
        if self.stream.is_some() {
            return;
        }
        log::info!("Capture resuming");
        match self.restart_stream() {
            Ok(()) => self.set_status(CaptureStatus::Active),
            Err(e) => self.recover(format!("resume failed: {}", e)),
        }
    }

    /// The frame geometry just changed under us, so buffered segments no
    /// longer splice with new ones. Drop history and start rotation fresh.
    fn display_changed(&mut self) {
        log::info!("Display configuration changed, resetting buffer");
        if let Some(open) = self.open.take() {
            open.sink.discard();
        }
        self.source.stop();
        self.stream = None;
        // A finalize still in flight must not re-register pre-change history
        // after the clear
        self.drain_finalizers();
        {
            let mut buffer = self.buffer.write();
            buffer.clear();
        }
        self.state.write().buffered_secs = 0.0;
        self.observer.buffered_duration_changed(0.0);

        match self.restart_stream() {
            Ok(()) => self.set_status(CaptureStatus::Active),
            Err(e) => self.recover(format!("restart after display change failed: {}", e)),
        }
    }

    fn restart_stream(&mut self) -> Result<(), CaptureError> {
        let stream = self
            .source
            .start(&self.config.source_config(self.current_rate))
            .map_err(map_source_error)?;
        self.stream = Some(stream);
        self.open_segment()
    }

    fn apply_config(&mut self, config: SessionConfig) {
        let rate_relevant = config.frame_rate != self.config.frame_rate
            || config.bitrate_kbps != self.config.bitrate_kbps;
        self.adaptive = AdaptiveController::new(Duration::from_secs(
            config.idle_threshold_secs as u64,
        ));
        self.config = config;
        if rate_relevant {
            self.apply_rate(self.current_rate);
        }
    }

    fn apply_rate(&mut self, rate: RateTarget) {
        let source_config = self.config.source_config(rate);
        if let Err(e) = self.source.reconfigure(&source_config) {
            log::warn!("Failed to reconfigure capture source: {}", e);
            return;
        }
        self.current_rate = rate;
        {
            let mut state = self.state.write();
            state.active_frame_rate = source_config.frame_rate;
        }
        self.observer.state_changed(&self.state.read());
    }

    // ========================================================================
    // Housekeeping and recovery
    // ========================================================================

    fn tick(&mut self) {
        if self.stream.is_none() {
            return;
        }

        if self.config.adaptive {
            let idle_for = (self.idle_probe)();
            let signature = self.source.sample_signature();
            if let Some(target) = self.adaptive.tick(Instant::now(), idle_for, signature) {
                if target != self.current_rate {
                    log::info!(
                        "Adaptive controller requests {} rate",
                        match target {
                            RateTarget::Full => "full",
                            RateTarget::Idle => "idle",
                        }
                    );
                    self.pending_rate = Some(target);
                }
            }
        }

        // Expose closed history plus the open segment's progress
        let open_secs = self.open.as_ref().map_or(0.0, |o| o.sink.written_secs());
        let closed = self.buffer.read().buffered_duration();
        self.state.write().buffered_secs = closed + open_secs;
    }

    /// Stream failure: keep everything captured so far, then retry with
    /// exponential backoff. Exhausting the attempts is fatal.
    fn recover(&mut self, reason: String) {
        log::warn!("Capture stream interrupted: {}", reason);
        self.observer.warning(&format!("capture interrupted: {}", reason));

        if let Some(open) = self.open.take() {
            self.enqueue_finalize(open);
        }
        self.source.stop();
        self.stream = None;
        self.set_status(CaptureStatus::Recovering);

        // Commands arriving while the stream is down are held and applied
        // once it is back, not silently dropped
        let mut deferred: Vec<SessionCommand> = Vec::new();

        for attempt in 0..RECOVERY_MAX_ATTEMPTS {
            let delay = RECOVERY_BASE_DELAY
                .saturating_mul(1 << attempt)
                .min(RECOVERY_MAX_DELAY);
            log::info!(
                "Recovery attempt {}/{} in {:?}",
                attempt + 1,
                RECOVERY_MAX_ATTEMPTS,
                delay
            );

            // Stay responsive to Stop while waiting out the backoff
            let deadline = Instant::now() + delay;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.commands.recv_timeout(remaining) {
                    Ok(SessionCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(cmd) => deferred.push(cmd),
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }

            match self.restart_stream() {
                Ok(()) => {
                    log::info!("Capture stream recovered");
                    self.set_status(CaptureStatus::Active);
                    for cmd in std::mem::take(&mut deferred) {
                        self.handle_command(cmd);
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("Recovery attempt {} failed: {}", attempt + 1, e);
                }
            }
        }

        self.fail(CaptureError::StreamInterrupted(reason));
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.set_status(CaptureStatus::Stopping);
        if let Some(open) = self.open.take() {
            self.enqueue_finalize(open);
        }
        self.source.stop();
        self.stream = None;
        if let Some(tx) = self.finalize_tx.take() {
            drop(tx);
        }
        if let Some(worker) = self.finalize_worker.take() {
            let _ = worker.join();
        }
        {
            let mut state = self.state.write();
            state.status = CaptureStatus::Idle;
            state.started_at = None;
            state.buffered_secs = self.buffer.read().buffered_duration();
        }
        self.observer.state_changed(&self.state.read());
        log::info!("Capture session stopped");
    }

    fn fail(&mut self, error: CaptureError) {
        log::error!("Capture session failed: {}", error);
        self.observer.fatal_error(&error);
        self.shutdown();
    }

    fn set_status(&mut self, status: CaptureStatus) {
        {
            let mut state = self.state.write();
            if state.status == status {
                return;
            }
            state.status = status;
        }
        self.observer.state_changed(&self.state.read());
    }
}

enum Loop {
    Command(SessionCommand),
    Frame(FrameEvent),
    Tick,
}

fn map_source_error(e: SourceError) -> CaptureError {
    match e {
        SourceError::NoCaptureElement => {
            CaptureError::StreamSetupFailed("no screen capture backend available".into())
        }
        other => {
            let message = other.to_string();
            // Capture backends report missing screen-recording consent as a
            // pipeline error; surface it as the actionable variant
            let lowered = message.to_lowercase();
            if lowered.contains("permission") || lowered.contains("not authorized") {
                CaptureError::PermissionDenied
            } else {
                CaptureError::StreamSetupFailed(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::segment_writer::{
        FinalizedSegment, Result as WriterResult, SegmentSink, SegmentSinkFactory,
    };
    use crate::capture::source::{EncodedFrame, FrameSignature, StreamFormat};
    use crate::capture::NullObserver;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Scripted source: the test injects events through a retained sender
    // ------------------------------------------------------------------

    struct ScriptedSource {
        injector: Arc<Mutex<Option<Sender<FrameEvent>>>>,
        starts: Arc<AtomicUsize>,
        keyframe_requests: Arc<AtomicUsize>,
        fail_next_start: Arc<Mutex<usize>>,
    }

    impl FrameSource for ScriptedSource {
        fn start(
            &mut self,
            _config: &SourceConfig,
        ) -> crate::capture::source::Result<FrameStream> {
            {
                let mut failures = self.fail_next_start.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SourceError::Pipeline("scripted failure".into()));
                }
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = crossbeam_channel::bounded(64);
            *self.injector.lock() = Some(tx);
            Ok(FrameStream {
                format: StreamFormat {
                    video_caps: "video/x-h264".into(),
                    audio_caps: None,
                    frame_rate: 30,
                },
                events: rx,
            })
        }

        fn reconfigure(&mut self, _config: &SourceConfig) -> crate::capture::source::Result<()> {
            Ok(())
        }

        fn force_keyframe(&self) {
            self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn sample_signature(&self) -> Option<FrameSignature> {
            None
        }

        fn stop(&mut self) {
            *self.injector.lock() = None;
        }
    }

    struct Harness {
        injector: Arc<Mutex<Option<Sender<FrameEvent>>>>,
        starts: Arc<AtomicUsize>,
        keyframe_requests: Arc<AtomicUsize>,
        fail_next_start: Arc<Mutex<usize>>,
        log: Arc<Mutex<Vec<String>>>,
        buffer: Arc<RwLock<RollingBuffer>>,
        slow_first_finalize: Option<Duration>,
        _tmp: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            Self {
                injector: Arc::new(Mutex::new(None)),
                starts: Arc::new(AtomicUsize::new(0)),
                keyframe_requests: Arc::new(AtomicUsize::new(0)),
                fail_next_start: Arc::new(Mutex::new(0)),
                log: Arc::new(Mutex::new(Vec::new())),
                buffer: Arc::new(RwLock::new(RollingBuffer::new(
                    tmp.path().to_path_buf(),
                    3600,
                ))),
                slow_first_finalize: None,
                _tmp: tmp,
            }
        }

        /// The first sink's finalize sleeps, like a muxer stuck flushing a
        /// long segment while a short one closes right behind it
        fn with_slow_first_finalize(delay: Duration) -> Self {
            let mut h = Self::new();
            h.slow_first_finalize = Some(delay);
            h
        }

        fn source(&self) -> Box<dyn FrameSource> {
            Box::new(ScriptedSource {
                injector: self.injector.clone(),
                starts: self.starts.clone(),
                keyframe_requests: self.keyframe_requests.clone(),
                fail_next_start: self.fail_next_start.clone(),
            })
        }

        fn factory(&self) -> Box<dyn SegmentSinkFactory> {
            Box::new(RecordingFactory {
                log: self.log.clone(),
                counter: Arc::new(AtomicUsize::new(0)),
                slow_first_finalize: self.slow_first_finalize,
            })
        }

        fn spawn(&self, segment_secs: u32) -> SessionHandle {
            CaptureSession::spawn(
                session_config(segment_secs),
                self.source(),
                self.factory(),
                self.buffer.clone(),
                Arc::new(NullObserver),
                Box::new(|| Duration::ZERO),
                Box::new(|| true),
            )
            .unwrap()
        }

        fn inject(&self, event: FrameEvent) {
            let sender = self
                .injector
                .lock()
                .clone()
                .expect("source is not started");
            sender.send(event).unwrap();
        }

        fn wait_until(&self, mut cond: impl FnMut() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !cond() {
                assert!(Instant::now() < deadline, "condition not reached in time");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn session_config(segment_secs: u32) -> SessionConfig {
        SessionConfig {
            segment_secs,
            frame_rate: 30,
            idle_frame_rate: 5,
            bitrate_kbps: 5000,
            capture_audio: false,
            adaptive: false,
            idle_threshold_secs: 120,
        }
    }

    fn frame(pts_secs: f64, duration_secs: f64, keyframe: bool) -> FrameEvent {
        FrameEvent::Video(EncodedFrame {
            data: vec![0u8; 128],
            pts: (pts_secs * 1e9) as u64,
            duration: (duration_secs * 1e9) as u64,
            is_keyframe: keyframe,
            wall_time: Instant::now(),
        })
    }

    // ------------------------------------------------------------------
    // Recording sink: logs open/finalize ordering, counts frames
    // ------------------------------------------------------------------

    struct RecordingFactory {
        log: Arc<Mutex<Vec<String>>>,
        counter: Arc<AtomicUsize>,
        slow_first_finalize: Option<Duration>,
    }

    impl SegmentSinkFactory for RecordingFactory {
        fn open(&self, path: &Path, _format: &StreamFormat) -> WriterResult<Box<dyn SegmentSink>> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(format!("open:{}", n));
            std::fs::write(path, b"segment").unwrap();
            Ok(Box::new(RecordingSink {
                log: self.log.clone(),
                n,
                path: path.to_path_buf(),
                pts_offset: None,
                written_ns: 0,
                frames: 0,
                finalize_delay: if n == 0 { self.slow_first_finalize } else { None },
            }))
        }
    }

    struct RecordingSink {
        log: Arc<Mutex<Vec<String>>>,
        n: usize,
        path: std::path::PathBuf,
        pts_offset: Option<u64>,
        written_ns: u64,
        frames: usize,
        finalize_delay: Option<Duration>,
    }

    impl SegmentSink for RecordingSink {
        fn push_video(&mut self, frame: &EncodedFrame) -> WriterResult<()> {
            let offset = *self.pts_offset.get_or_insert(frame.pts);
            self.written_ns = frame.pts.saturating_sub(offset) + frame.duration;
            self.frames += 1;
            Ok(())
        }

        fn push_audio(&mut self, _frame: &EncodedFrame) -> WriterResult<()> {
            Ok(())
        }

        fn written_secs(&self) -> f64 {
            self.written_ns as f64 / 1e9
        }

        fn finalize(self: Box<Self>) -> WriterResult<FinalizedSegment> {
            if let Some(delay) = self.finalize_delay {
                std::thread::sleep(delay);
            }
            self.log
                .lock()
                .push(format!("finalize:{}:{}", self.n, self.frames));
            Ok(FinalizedSegment {
                path: self.path.clone(),
                duration_secs: self.written_ns as f64 / 1e9,
                size_bytes: 7,
                has_audio: false,
            })
        }

        fn discard(self: Box<Self>) {
            self.log.lock().push(format!("discard:{}", self.n));
            let _ = std::fs::remove_file(&self.path);
        }
    }

    // ------------------------------------------------------------------

    #[test]
    fn rotates_on_keyframe_with_next_sink_opened_before_finalize() {
        let h = Harness::new();
        let handle = h.spawn(1);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        h.inject(frame(0.5, 0.5, false));
        // Rotation is due; a delta frame must not trigger it
        h.inject(frame(1.0, 0.5, false));
        h.wait_until(|| h.keyframe_requests.load(Ordering::SeqCst) >= 1);
        // The keyframe lands in the next segment
        h.inject(frame(1.5, 0.5, true));
        h.wait_until(|| h.buffer.read().len() == 1);

        handle.stop();

        let log = h.log.lock().clone();
        let open1 = log.iter().position(|e| e == "open:1").unwrap();
        let finalize0 = log.iter().position(|e| e.starts_with("finalize:0")).unwrap();
        assert!(
            open1 < finalize0,
            "next segment must open before the previous finalizes: {:?}",
            log
        );
        // Segment 0 got three frames; the rotation keyframe went to segment 1
        assert!(log.contains(&"finalize:0:3".to_string()), "{:?}", log);
    }

    #[test]
    fn stop_finalizes_open_segment() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        h.inject(frame(0.5, 0.5, false));

        handle.stop();
        assert_eq!(h.buffer.read().len(), 1);
        let status = h.buffer.read().status();
        assert!((status.buffered_secs - 1.0).abs() < 0.01);
    }

    #[test]
    fn pause_closes_segment_and_resume_opens_fresh_one() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        handle.send(SessionCommand::Pause);
        h.wait_until(|| handle.state().status == CaptureStatus::Paused);
        h.wait_until(|| h.buffer.read().len() == 1);

        handle.send(SessionCommand::Resume);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);
        assert_eq!(h.starts.load(Ordering::SeqCst), 2);

        h.inject(frame(0.0, 0.5, true));
        handle.stop();
        assert_eq!(h.buffer.read().len(), 2);
    }

    #[test]
    fn interruption_recovers_and_keeps_history() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        h.inject(FrameEvent::Interrupted("gpu reset".into()));

        // Partial segment survives, stream restarts after backoff
        h.wait_until(|| h.buffer.read().len() == 1);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);
        assert_eq!(h.starts.load(Ordering::SeqCst), 2);

        handle.stop();
    }

    #[test]
    fn metadata_only_frames_are_skipped() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(FrameEvent::Video(EncodedFrame {
            data: Vec::new(),
            pts: 0,
            duration: 0,
            is_keyframe: true,
            wall_time: Instant::now(),
        }));
        h.inject(frame(0.0, 0.5, true));

        handle.stop();
        let log = h.log.lock().clone();
        // Only the real frame was written
        assert!(log.contains(&"finalize:0:1".to_string()), "{:?}", log);
    }

    #[test]
    fn display_change_clears_buffer_and_restarts() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        handle.send(SessionCommand::Pause);
        h.wait_until(|| h.buffer.read().len() == 1);
        handle.send(SessionCommand::Resume);
        h.wait_until(|| h.starts.load(Ordering::SeqCst) == 2);

        handle.send(SessionCommand::DisplayChanged);
        h.wait_until(|| h.buffer.read().is_empty());
        h.wait_until(|| h.starts.load(Ordering::SeqCst) == 3);

        handle.stop();
    }

    #[test]
    fn missing_consent_refuses_to_start_without_touching_the_source() {
        let h = Harness::new();
        let result = CaptureSession::spawn(
            session_config(60),
            h.source(),
            h.factory(),
            h.buffer.clone(),
            Arc::new(NullObserver),
            Box::new(|| Duration::ZERO),
            Box::new(|| false),
        );

        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert_eq!(h.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slow_finalize_does_not_reorder_registration() {
        let h = Harness::with_slow_first_finalize(Duration::from_millis(300));
        let handle = h.spawn(1);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        h.inject(frame(0.5, 0.5, false));
        // Rotation keyframe: segment 0 goes to the slow finalize
        h.inject(frame(1.0, 0.5, true));
        h.wait_until(|| h.log.lock().iter().any(|e| e == "open:1"));
        // Segment 1 closes while segment 0 is still flushing
        handle.send(SessionCommand::Pause);
        h.wait_until(|| h.buffer.read().len() == 2);

        let log = h.log.lock().clone();
        let f0 = log.iter().position(|e| e.starts_with("finalize:0")).unwrap();
        let f1 = log.iter().position(|e| e.starts_with("finalize:1")).unwrap();
        assert!(f0 < f1, "slow segment must land first: {:?}", log);

        let segments = h.buffer.read().segments_for_range(f64::INFINITY);
        assert!(
            segments.windows(2).all(|w| w[0].started_at <= w[1].started_at),
            "history must stay chronological"
        );

        handle.stop();
    }

    #[test]
    fn commands_sent_during_recovery_apply_after_restart() {
        let h = Harness::new();
        let handle = h.spawn(60);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);

        h.inject(frame(0.0, 0.5, true));
        h.inject(FrameEvent::Interrupted("gpu reset".into()));
        h.wait_until(|| handle.state().status == CaptureStatus::Recovering);
        // Lands while the session is waiting out the backoff
        handle.send(SessionCommand::Pause);

        h.wait_until(|| handle.state().status == CaptureStatus::Paused);
        assert_eq!(h.starts.load(Ordering::SeqCst), 2);

        handle.send(SessionCommand::Resume);
        h.wait_until(|| handle.state().status == CaptureStatus::Active);
        handle.stop();
    }
}
