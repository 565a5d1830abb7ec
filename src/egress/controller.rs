//! Process-supervised streaming controller
//!
//! Owns the delivery state machine: `Stopped → Starting → Running →
//! Reconnecting ⇄ Running → Stopped`. Frames are requested on the shared
//! timer tick and fed to the encoder process behind a backpressure gate;
//! failures tear the process down and relaunch it with the last good
//! settings after a fixed backoff, while a fatal "unknown encoder"
//! diagnostic forces the software fallback and restarts immediately.
//! Status transitions fan out on a broadcast channel.

use chrono::{DateTime, Utc};
use crossbeam_channel::unbounded;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use parking_lot::Mutex;

use crate::config::{AppConfig, StreamSettings};
use crate::egress::command::{build_passthrough_args, build_pipe_args};
use crate::egress::encoder::{
    probe_encoders, recommended_bitrate_kbps, select_encoder, EncoderKind, EncoderSet,
};
use crate::egress::process::{EncoderProcess, ProcEvent, WriteOutcome};
use crate::error::{Error, Result};
use crate::frame::FrameProvider;
use crate::rate::FrameRateRegistry;
use crate::sched::{TaskHandle, TimerService};
use crate::session::MasterClockSession;

/// Delivery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
}

/// User-visible stream status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Started,
    Reconnecting,
    Error,
    Stopped,
}

/// One status notification
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub status: StreamStatus,
    /// Identifies one `start()`..`stop()` attempt across reconnects
    pub attempt: Uuid,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    /// JSON form for log sinks and IPC surfaces
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

struct Inner {
    state: ControllerState,
    stopping: bool,
    /// Bumped on every (re)launch; events from older processes are stale
    generation: u64,
    attempt: Uuid,
    settings: Option<StreamSettings>,
    provider: Option<FrameProvider>,
    ffmpeg: Option<PathBuf>,
    probed: Option<EncoderSet>,
    forced_fallback: bool,
    process: Option<EncoderProcess>,
    tick: Option<TaskHandle>,
    session: Option<MasterClockSession>,
    reconnect: Option<tokio::task::JoinHandle<()>>,
}

/// The supervised streaming controller. An owned service object: create
/// one at application start (inside the tokio runtime) and share it.
pub struct PipelineController {
    app: AppConfig,
    timer: Arc<TimerService>,
    registry: Option<Arc<FrameRateRegistry>>,
    runtime: tokio::runtime::Handle,
    status_tx: broadcast::Sender<StatusEvent>,
    inner: Mutex<Inner>,
    dropped_frames: AtomicU64,
    /// Self-reference handed to timer ticks, event pumps and reconnect
    /// tasks; they must not keep the controller alive
    weak: std::sync::Weak<Self>,
}

impl PipelineController {
    /// Must be called from within a tokio runtime.
    pub fn new(
        app: AppConfig,
        timer: Arc<TimerService>,
        registry: Option<Arc<FrameRateRegistry>>,
    ) -> Arc<Self> {
        let (status_tx, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            app,
            timer,
            registry,
            runtime: tokio::runtime::Handle::current(),
            status_tx,
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                state: ControllerState::Stopped,
                stopping: false,
                generation: 0,
                attempt: Uuid::nil(),
                settings: None,
                provider: None,
                ffmpeg: None,
                probed: None,
                forced_fallback: false,
                process: None,
                tick: None,
                session: None,
                reconnect: None,
            }),
            dropped_frames: AtomicU64::new(0),
        })
    }

    /// Subscribe to status notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.inner.lock().state, ControllerState::Stopped)
    }

    /// Frames shed by the backpressure gate since construction
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Start streaming. Configuration problems fail here synchronously;
    /// anything transient later is retried internally and surfaced as
    /// status events.
    pub fn start(
        &self,
        settings: StreamSettings,
        provider: FrameProvider,
    ) -> Result<()> {
        settings.validate()?;

        let mut inner = self.inner.lock();
        if inner.state != ControllerState::Stopped {
            return Ok(());
        }
        inner.state = ControllerState::Starting;
        inner.stopping = false;
        inner.forced_fallback = false;
        inner.attempt = Uuid::new_v4();
        let ffmpeg = match self.resolve_ffmpeg() {
            Ok(path) => path,
            Err(e) => {
                inner.state = ControllerState::Stopped;
                return Err(e);
            }
        };
        inner.ffmpeg = Some(ffmpeg);
        inner.settings = Some(settings);
        inner.provider = Some(provider);

        match self.launch(&mut inner) {
            Ok(()) => {
                inner.state = ControllerState::Running;
                let attempt = inner.attempt;
                drop(inner);
                self.emit(StreamStatus::Started, attempt, None);
                Ok(())
            }
            Err(e) => {
                inner.state = ControllerState::Stopped;
                inner.settings = None;
                inner.provider = None;
                Err(e)
            }
        }
    }

    /// Stop streaming and suppress any pending reconnect. Idempotent and
    /// safe from any thread.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ControllerState::Stopped {
            return;
        }
        inner.stopping = true;
        if let Some(reconnect) = inner.reconnect.take() {
            reconnect.abort();
        }
        self.teardown_delivery(&mut inner);
        inner.state = ControllerState::Stopped;
        inner.settings = None;
        inner.provider = None;
        let attempt = inner.attempt;
        drop(inner);
        self.emit(StreamStatus::Stopped, attempt, None);
    }

    /// Update the global target rate: propagates to the cadence registry
    /// and retunes the live frame tick.
    pub fn set_target_fps(&self, fps: u32) -> Result<()> {
        if fps == 0 || fps > 240 {
            return Err(Error::Config(format!("fps out of range: {fps}")));
        }
        if let Some(registry) = &self.registry {
            registry.set_target_fps(fps as f64)?;
        }
        let mut inner = self.inner.lock();
        if let Some(settings) = inner.settings.as_mut() {
            settings.fps = fps;
        }
        if let Some(tick) = inner.tick.as_ref() {
            tick.set_interval(Duration::from_secs_f64(1.0 / fps as f64));
        }
        tracing::info!(fps, "delivery frame rate updated");
        Ok(())
    }

    /// Program source switched. The master-clock backend realigns its
    /// audio; the pipe path has no live buffer to adjust.
    pub fn on_source_switch(&self, delay_ms: u64) {
        let inner = self.inner.lock();
        match &inner.session {
            Some(session) => session.on_source_switch(delay_ms),
            None => tracing::debug!("source switch ignored by pipe delivery"),
        }
    }

    /// Re-align audio to a media file position while live. The pipe path
    /// has no session object to notify, so this is a fast full restart of
    /// the encoder process with updated input parameters.
    pub fn resync_to_media(&self, media_path: Option<&std::path::Path>, start_ms: u64) {
        let mut inner = self.inner.lock();
        if inner.state == ControllerState::Stopped || inner.settings.is_none() {
            return;
        }
        let settings = inner.settings.as_mut().expect("checked above");

        match media_path {
            None => {
                // Switched to a non-media source: leave passthrough mode
                if settings.direct_passthrough {
                    settings.direct_passthrough = false;
                    settings.media_audio_path = None;
                    settings.media_audio_start_ms = 0;
                    tracing::info!("media gone, restarting in pipe mode");
                    self.immediate_restart(&mut inner);
                }
            }
            Some(path) => {
                settings.media_audio_path = Some(path.to_path_buf());
                settings.media_audio_start_ms = start_ms;
                settings.capture_audio = false;
                settings.audio_device.clear();
                tracing::info!(path = %path.display(), start_ms, "resyncing to media");
                self.immediate_restart(&mut inner);
            }
        }
    }

    /// Apply a new A/V delay and restart quickly so it takes effect.
    pub fn update_av_delay(&self, delay_ms: i64) {
        let mut inner = self.inner.lock();
        if inner.settings.is_none() {
            return;
        }
        inner.settings.as_mut().expect("checked above").av_sync_delay_ms = delay_ms;
        if inner.state != ControllerState::Stopped {
            self.immediate_restart(&mut inner);
        }
    }

    // ---- internals ----

    fn resolve_ffmpeg(&self) -> Result<PathBuf> {
        if let Some(path) = &self.app.ffmpeg_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::Config(format!(
                "configured ffmpeg not found: {}",
                path.display()
            )));
        }
        which::which("ffmpeg")
            .map_err(|_| Error::Config("ffmpeg not found on PATH; install it or set ffmpeg_path".into()))
    }

    /// Launch delivery for the cached settings. Caller holds the lock and
    /// owns the state transition.
    fn launch(&self, inner: &mut Inner) -> Result<()> {
        let settings = inner.settings.clone().expect("settings cached");
        let provider = inner.provider.clone().expect("provider cached");
        let ffmpeg = inner.ffmpeg.clone().expect("ffmpeg resolved");
        inner.generation += 1;
        let generation = inner.generation;

        // Preferred path: in-process master-clock session
        if settings.use_master_clock && !settings.direct_passthrough {
            match MasterClockSession::open(&settings, &self.app, &ffmpeg, provider.clone()) {
                Ok(session) => {
                    inner.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("master-clock session unavailable ({e}), using frame pipe");
                }
            }
        }

        let encoder = self.choose_encoder(inner, &settings, &ffmpeg);
        let bitrate = settings.bitrate_kbps.unwrap_or_else(|| {
            recommended_bitrate_kbps(settings.width, settings.height, settings.fps)
        });

        let media_path = settings
            .media_audio_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty());
        let passthrough = settings.direct_passthrough && media_path.is_some();

        let args = if passthrough {
            build_passthrough_args(
                &settings,
                media_path.as_deref().expect("checked above"),
                encoder,
                bitrate,
            )
        } else {
            build_pipe_args(&settings, encoder, bitrate)
        };
        tracing::info!(
            encoder = encoder.ffmpeg_name(),
            bitrate_kbps = bitrate,
            passthrough,
            "starting encoder process"
        );

        let (events, event_rx) = unbounded::<ProcEvent>();
        let process = EncoderProcess::spawn(&ffmpeg, &args, settings.frame_bytes(), events)?;

        // Pump process events back into the state machine; stale
        // generations are discarded on arrival
        let pump = self.weak.clone();
        self.runtime.spawn_blocking(move || {
            while let Ok(event) = event_rx.recv() {
                let Some(controller) = pump.upgrade() else {
                    return;
                };
                controller.handle_proc_event(generation, event);
            }
        });

        if passthrough {
            inner.tick = None;
        } else {
            let writer = process.writer();
            let dropped = {
                let controller = self.weak.clone();
                move || {
                    if let Some(controller) = controller.upgrade() {
                        controller.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    }
                }
            };
            let (width, height) = (settings.width, settings.height);
            let direct = settings.direct_passthrough;
            let tick_provider = provider;
            inner.tick = Some(self.timer.register(
                "egress-frames",
                Duration::from_secs_f64(1.0 / settings.fps as f64),
                move || {
                    let Some(frame) = tick_provider(width, height, direct) else {
                        return;
                    };
                    let frame = if frame.matches(width, height) {
                        frame
                    } else {
                        frame.fit_to(width, height)
                    };
                    match writer.try_write(frame.data) {
                        WriteOutcome::Queued => {}
                        WriteOutcome::Dropped => {
                            dropped();
                            tracing::debug!("frame dropped due to backpressure");
                        }
                        // Closed means a reconnect is already in flight
                        WriteOutcome::Closed => {}
                    }
                },
            ));
        }

        inner.process = Some(process);
        Ok(())
    }

    /// Pick the encoder: explicit preference, forced fallback, then the
    /// best probed hardware encoder. The probe runs once and is cached.
    fn choose_encoder(
        &self,
        inner: &mut Inner,
        settings: &StreamSettings,
        ffmpeg: &std::path::Path,
    ) -> EncoderKind {
        if inner.forced_fallback {
            return EncoderKind::X264;
        }
        if let Some(name) = settings.codec.as_deref().filter(|c| !c.is_empty()) {
            match EncoderKind::from_name(name) {
                Some(kind) => return kind,
                None => tracing::warn!(codec = name, "unknown codec preference, probing instead"),
            }
        }
        if inner.probed.is_none() {
            inner.probed = Some(match probe_encoders(ffmpeg) {
                Ok(set) => set,
                Err(e) => {
                    tracing::warn!("encoder probe failed ({e}), assuming software only");
                    EncoderSet::new()
                }
            });
        }
        select_encoder(inner.probed.as_ref().expect("probed above"))
    }

    fn handle_proc_event(&self, generation: u64, event: ProcEvent) {
        let mut inner = self.inner.lock();
        if inner.stopping || generation != inner.generation {
            return;
        }
        match event {
            ProcEvent::FatalDiagnostic(line) => {
                if !inner.forced_fallback {
                    tracing::warn!(diagnostic = %line, "encoder rejected, forcing software fallback");
                    inner.forced_fallback = true;
                    // Correctness fallback, not a transient failure: no backoff
                    self.immediate_restart(&mut inner);
                }
            }
            ProcEvent::WriteFailed(reason) => {
                tracing::warn!(reason = %reason, "encoder pipe broken");
                self.begin_reconnect(&mut inner);
            }
            ProcEvent::Exited(code) => {
                tracing::warn!(?code, "encoder process exited unexpectedly");
                self.begin_reconnect(&mut inner);
            }
        }
    }

    fn begin_reconnect(&self, inner: &mut Inner) {
        self.teardown_delivery(inner);
        inner.state = ControllerState::Reconnecting;
        let attempt = inner.attempt;
        self.emit(StreamStatus::Reconnecting, attempt, None);
        self.schedule_reconnect(inner);
    }

    fn schedule_reconnect(&self, inner: &mut Inner) {
        if let Some(previous) = inner.reconnect.take() {
            previous.abort();
        }
        let delay = Duration::from_millis(self.app.reconnect_delay_ms);
        let controller = self.weak.clone();
        inner.reconnect = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = controller.upgrade() {
                controller.try_restart();
            }
        }));
    }

    fn try_restart(&self) {
        let mut inner = self.inner.lock();
        if inner.stopping || inner.state == ControllerState::Stopped {
            return;
        }
        match self.launch(&mut inner) {
            Ok(()) => {
                inner.state = ControllerState::Running;
                let attempt = inner.attempt;
                drop(inner);
                self.emit(StreamStatus::Started, attempt, Some("reconnected".into()));
            }
            Err(e) => {
                tracing::warn!("reconnect failed: {e}");
                let attempt = inner.attempt;
                self.emit(StreamStatus::Error, attempt, Some(e.to_string()));
                self.schedule_reconnect(&mut inner);
            }
        }
    }

    /// Kill the current delivery (process or session). Lock held by caller.
    fn teardown_delivery(&self, inner: &mut Inner) {
        inner.tick = None;
        // Invalidate in-flight events from the old process
        inner.generation += 1;
        if let Some(process) = inner.process.take() {
            process.shutdown();
        }
        if let Some(session) = inner.session.take() {
            session.stop();
        }
    }

    /// Tear down and relaunch without backoff
    fn immediate_restart(&self, inner: &mut Inner) {
        self.teardown_delivery(inner);
        match self.launch(inner) {
            Ok(()) => {
                inner.state = ControllerState::Running;
            }
            Err(e) => {
                tracing::warn!("immediate restart failed: {e}");
                inner.state = ControllerState::Reconnecting;
                let attempt = inner.attempt;
                self.emit(StreamStatus::Reconnecting, attempt, Some(e.to_string()));
                self.schedule_reconnect(inner);
            }
        }
    }

    fn emit(&self, status: StreamStatus, attempt: Uuid, message: Option<String>) {
        let _ = self.status_tx.send(StatusEvent {
            status,
            attempt,
            at: Utc::now(),
            message,
        });
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.stopping = true;
        if let Some(reconnect) = inner.reconnect.take() {
            reconnect.abort();
        }
        self.teardown_delivery(&mut inner);
        inner.state = ControllerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoFrame;
    use std::io::Write;

    fn provider() -> FrameProvider {
        Arc::new(|w, h, _| Some(VideoFrame::black(w, h)))
    }

    fn settings(target: &str) -> StreamSettings {
        StreamSettings {
            target: target.into(),
            width: 64,
            height: 36,
            fps: 30,
            codec: Some("libx264".into()),
            ..Default::default()
        }
    }

    /// A fake ffmpeg that exits immediately with success
    #[cfg(unix)]
    fn fake_ffmpeg_exiting(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("ffmpeg");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexit 0").unwrap();
        drop(file);
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A fake ffmpeg that consumes stdin until killed
    #[cfg(unix)]
    fn fake_ffmpeg_running(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("ffmpeg");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nexec cat > /dev/null").unwrap();
        drop(file);
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn app_with(ffmpeg: PathBuf, reconnect_ms: u64) -> AppConfig {
        AppConfig {
            ffmpeg_path: Some(ffmpeg),
            reconnect_delay_ms: reconnect_ms,
            ..Default::default()
        }
    }

    async fn next_status(
        rx: &mut broadcast::Receiver<StatusEvent>,
        timeout: Duration,
    ) -> Option<StreamStatus> {
        tokio::time::timeout(timeout, rx.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
            .map(|e| e.status)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_requires_target() {
        let timer = Arc::new(TimerService::new());
        let controller = PipelineController::new(AppConfig::default(), timer, None);
        let result = controller.start(StreamSettings::default(), provider());
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!controller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_ffmpeg_fails_fast() {
        let timer = Arc::new(TimerService::new());
        let app = app_with(PathBuf::from("/nonexistent/ffmpeg"), 100);
        let controller = PipelineController::new(app, timer, None);
        let result = controller.start(settings("rtmp://x/y"), provider());
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!controller.is_running());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unexpected_exit_triggers_reconnect_and_stop_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let timer = Arc::new(TimerService::new());
        // Short backoff so the test observes a full cycle quickly
        let app = app_with(fake_ffmpeg_exiting(dir.path()), 100);
        let controller = PipelineController::new(app, timer, None);
        let mut rx = controller.subscribe();

        controller.start(settings("rtmp://x/y"), provider()).unwrap();
        assert_eq!(
            next_status(&mut rx, Duration::from_secs(2)).await,
            Some(StreamStatus::Started)
        );
        // The fake exits immediately: reconnecting state follows
        assert_eq!(
            next_status(&mut rx, Duration::from_secs(2)).await,
            Some(StreamStatus::Reconnecting)
        );
        // The backoff relaunch reuses the cached settings and succeeds in
        // spawning again
        assert_eq!(
            next_status(&mut rx, Duration::from_secs(2)).await,
            Some(StreamStatus::Started)
        );

        controller.stop();
        // Drain to the Stopped notification
        let mut saw_stopped = false;
        while let Some(status) = next_status(&mut rx, Duration::from_millis(300)).await {
            if status == StreamStatus::Stopped {
                saw_stopped = true;
                break;
            }
        }
        assert!(saw_stopped);
        assert!(!controller.is_running());

        // No revival after stop: any pending reconnect was canceled
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(next_status(&mut rx, Duration::from_millis(100)).await.is_none());
        assert!(!controller.is_running());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_process_streams_frames() {
        let dir = tempfile::tempdir().unwrap();
        let timer = Arc::new(TimerService::new());
        let app = app_with(fake_ffmpeg_running(dir.path()), 500);
        let controller = PipelineController::new(app, timer, None);
        let mut rx = controller.subscribe();

        controller.start(settings("rtmp://x/y"), provider()).unwrap();
        assert_eq!(
            next_status(&mut rx, Duration::from_secs(2)).await,
            Some(StreamStatus::Started)
        );
        assert!(controller.is_running());

        // Let several frame ticks run against the live process
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.stop();
        assert!(!controller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let timer = Arc::new(TimerService::new());
        let controller = PipelineController::new(AppConfig::default(), timer, None);
        controller.stop();
        controller.stop();
        assert!(!controller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_target_fps_validates_and_propagates() {
        let timer = Arc::new(TimerService::new());
        let registry = Arc::new(FrameRateRegistry::new(30.0).unwrap());
        let controller =
            PipelineController::new(AppConfig::default(), timer, Some(registry.clone()));

        assert!(controller.set_target_fps(0).is_err());
        controller.set_target_fps(60).unwrap();
        assert!((registry.target_fps() - 60.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_event_serializes() {
        let event = StatusEvent {
            status: StreamStatus::Reconnecting,
            attempt: Uuid::nil(),
            at: Utc::now(),
            message: None,
        };
        let json = event.to_json();
        assert!(json.contains("\"reconnecting\""));
        assert!(!json.contains("message"));
    }
}
