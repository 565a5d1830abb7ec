//! Supervised encoder child process
//!
//! Owns the ffmpeg child plus its writer and diagnostic threads. Frames
//! travel through a bounded channel to a dedicated writer thread, with a
//! byte-level backpressure gate in front: when more than two frames'
//! worth of raw bytes are already queued, the current frame is dropped
//! rather than letting the scheduler tick block. Process exit, write
//! failures and fatal diagnostic lines surface as [`ProcEvent`]s.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants::BACKPRESSURE_FRAMES;
use crate::egress::encoder::is_fatal_encoder_line;
use crate::error::TransportError;

/// Writer channel depth, in frames
const WRITE_CHANNEL_CAPACITY: usize = 8;

/// How long shutdown waits for a voluntary exit before killing
const EXIT_WAIT: Duration = Duration::from_secs(3);

/// Poll period for the exit monitor
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Events surfaced from a supervised process
#[derive(Debug, Clone)]
pub enum ProcEvent {
    /// The diagnostic stream reported the encoder cannot run at all
    FatalDiagnostic(String),
    /// Writing a frame to stdin failed (broken pipe)
    WriteFailed(String),
    /// The process exited on its own
    Exited(Option<i32>),
}

/// Outcome of offering one frame to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Queued,
    /// Shed due to backpressure
    Dropped,
    /// The writer is gone; a reconnect is in flight
    Closed,
}

/// Cheap handle used by the frame tick to feed the writer
#[derive(Clone)]
pub struct WriterHandle {
    tx: Sender<Bytes>,
    queued_bytes: Arc<AtomicU64>,
    frame_bytes: usize,
}

impl WriterHandle {
    pub(crate) fn new(tx: Sender<Bytes>, queued_bytes: Arc<AtomicU64>, frame_bytes: usize) -> Self {
        Self {
            tx,
            queued_bytes,
            frame_bytes,
        }
    }

    /// Bytes sitting in the write queue right now
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Offer a raw frame; drops instead of blocking when the queue holds
    /// more than [`BACKPRESSURE_FRAMES`] frames' worth of bytes.
    pub fn try_write(&self, frame: Bytes) -> WriteOutcome {
        let limit = (self.frame_bytes as u64) * BACKPRESSURE_FRAMES as u64;
        if self.queued_bytes() > limit {
            return WriteOutcome::Dropped;
        }
        let len = frame.len() as u64;
        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        match self.tx.try_send(frame) {
            Ok(()) => WriteOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                WriteOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                WriteOutcome::Closed
            }
        }
    }
}

/// A running supervised encoder process
pub struct EncoderProcess {
    child: Arc<Mutex<Child>>,
    stopping: Arc<AtomicBool>,
    writer_tx: Option<Sender<Bytes>>,
    writer_handle: WriterHandle,
    threads: Vec<JoinHandle<()>>,
    pid: u32,
}

impl EncoderProcess {
    /// Spawn `program args...` with piped stdin/stderr and start the
    /// writer, diagnostic and exit-monitor threads.
    pub fn spawn(
        program: &Path,
        args: &[String],
        frame_bytes: usize,
        events: Sender<ProcEvent>,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{}: {e}", program.display())))?;
        let pid = child.id();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdin on encoder process".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx): (Sender<Bytes>, Receiver<Bytes>) = bounded(WRITE_CHANNEL_CAPACITY);
        let queued_bytes = Arc::new(AtomicU64::new(0));
        let writer_handle = WriterHandle::new(tx.clone(), queued_bytes.clone(), frame_bytes);

        let mut threads = Vec::new();

        let writer_events = events.clone();
        let writer_queued = queued_bytes;
        threads.push(
            std::thread::Builder::new()
                .name("egress-write".into())
                .spawn(move || {
                    use std::io::Write;
                    for frame in rx {
                        // Empty frame is the shutdown sentinel; live frames
                        // are never zero-length
                        if frame.is_empty() {
                            break;
                        }
                        let len = frame.len() as u64;
                        let result = stdin.write_all(&frame);
                        writer_queued.fetch_sub(len, Ordering::AcqRel);
                        if let Err(e) = result {
                            let _ = writer_events.try_send(ProcEvent::WriteFailed(e.to_string()));
                            return;
                        }
                    }
                    // stdin drops here, sending EOF so the encoder can
                    // flush its trailer
                })
                .map_err(|e| TransportError::SpawnFailed(e.to_string()))?,
        );

        if let Some(stderr) = stderr {
            let diag_events = events.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("egress-diag".into())
                    .spawn(move || {
                        use std::io::BufRead;
                        for line in std::io::BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                            tracing::info!(target: "ffmpeg", "{line}");
                            if is_fatal_encoder_line(&line) {
                                let _ = diag_events.try_send(ProcEvent::FatalDiagnostic(line));
                            }
                        }
                    })
                    .map_err(|e| TransportError::SpawnFailed(e.to_string()))?,
            );
        }

        let child = Arc::new(Mutex::new(child));
        let stopping = Arc::new(AtomicBool::new(false));
        let monitor_child = child.clone();
        let monitor_stopping = stopping.clone();
        threads.push(
            std::thread::Builder::new()
                .name("egress-watch".into())
                .spawn(move || loop {
                    if monitor_stopping.load(Ordering::Acquire) {
                        return;
                    }
                    match monitor_child.lock().try_wait() {
                        Ok(Some(status)) => {
                            if !monitor_stopping.load(Ordering::Acquire) {
                                let _ = events.try_send(ProcEvent::Exited(status.code()));
                            }
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("process wait failed: {e}");
                            return;
                        }
                    }
                    std::thread::sleep(EXIT_POLL);
                })
                .map_err(|e| TransportError::SpawnFailed(e.to_string()))?,
        );

        tracing::info!(pid, "encoder process started");
        Ok(Self {
            child,
            stopping,
            writer_tx: Some(tx),
            writer_handle,
            threads,
            pid,
        })
    }

    pub fn writer(&self) -> WriterHandle {
        self.writer_handle.clone()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Graceful teardown: stop the writer (EOF on stdin), give the process
    /// a short grace period to flush, then kill it.
    pub fn shutdown(mut self) {
        self.stopping.store(true, Ordering::Release);
        // The sentinel ends the writer thread, which drops stdin; clones of
        // the writer handle may outlive us, so the channel itself cannot be
        // relied on to disconnect
        if let Some(tx) = self.writer_tx.take() {
            let _ = tx.send_timeout(Bytes::new(), Duration::from_millis(200));
        }

        let deadline = Instant::now() + EXIT_WAIT;
        loop {
            match self.child.lock().try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(pid = self.pid, ?status, "encoder process exited");
                    break;
                }
                Ok(None) if Instant::now() >= deadline => {
                    tracing::warn!(pid = self.pid, "encoder process unresponsive, killing");
                    let mut child = self.child.lock();
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                Ok(None) => std::thread::sleep(EXIT_POLL),
                Err(_) => break,
            }
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(tx) = self.writer_tx.take() {
            let _ = tx.try_send(Bytes::new());
        }
        {
            let mut child = self.child.lock();
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
