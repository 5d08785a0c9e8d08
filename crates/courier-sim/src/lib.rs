// Record/replay interception for unary and streaming transport calls.
use bytes::Bytes;
use courier_common::{Error, Result};
use courier_transport::{BidiStream, Transport};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod config;
pub mod record;
mod stream;

pub use config::SimulationConfig;
pub use record::{
    RECORDING_FORMAT_VERSION, RecordEntry, RecordedFrame, RecordedOutcome, StreamEnd,
    StreamTranscript,
};

use record::RecordLog;

/// How replayed calls are paced. There is no default: picking replay means
/// picking a timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayTiming {
    Instant,
    /// Sleep the recorded call time, and the recorded gap before each stream frame.
    Realistic,
    /// Sleep a constant per call and per stream frame.
    Fixed(Duration),
}

impl std::str::FromStr for ReplayTiming {
    type Err = Error;

    /// Parses `instant`, `realistic` or `fixed:<ms>`.
    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "instant" => Ok(ReplayTiming::Instant),
            "realistic" => Ok(ReplayTiming::Realistic),
            other => other
                .strip_prefix("fixed:")
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(|ms| ReplayTiming::Fixed(Duration::from_millis(ms)))
                .ok_or_else(|| Error::Simulation(format!("unknown replay timing {value:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimulationMode {
    #[default]
    Disabled,
    Recording,
    Replay(ReplayTiming),
}

/// One intercepted call. `operation` is the method path; `key` is a free-form
/// label (topic or subscription) kept with the recording.
#[derive(Debug, Clone)]
pub struct Call {
    pub operation: String,
    pub key: Option<String>,
    pub request: Bytes,
}

impl Call {
    pub fn new(operation: impl Into<String>, key: Option<String>, request: Bytes) -> Self {
        Self {
            operation: operation.into(),
            key,
            request,
        }
    }
}

/// Sits between the client and a `Transport`.
///
/// In recording mode every call is performed and logged. In replay mode calls
/// are answered from the log and the transport is never touched.
///
/// ```
/// use bytes::Bytes;
/// use courier_sim::{Call, ReplayTiming, SimulationLayer, SimulationMode};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().expect("rt").block_on(async {
/// let layer = SimulationLayer::detached(SimulationMode::Recording);
/// let call = Call::new("/echo", None, Bytes::from_static(b"ping"));
/// let reply = layer
///     .execute(call.clone(), |request| async move { Ok(request) })
///     .await
///     .expect("recorded");
///
/// layer.set_mode(SimulationMode::Replay(ReplayTiming::Instant));
/// let replayed = layer
///     .execute(call, |_| async { Ok(Bytes::from_static(b"never called")) })
///     .await
///     .expect("replayed");
/// assert_eq!(replayed, reply);
/// # });
/// ```
pub struct SimulationLayer {
    transport: Option<Arc<dyn Transport>>,
    mode: Mutex<SimulationMode>,
    log: Arc<Mutex<RecordLog>>,
    recording_path: Option<PathBuf>,
}

impl SimulationLayer {
    pub fn new(transport: Arc<dyn Transport>, mode: SimulationMode) -> Self {
        Self {
            transport: Some(transport),
            mode: Mutex::new(mode),
            log: Arc::new(Mutex::new(RecordLog::default())),
            recording_path: None,
        }
    }

    /// A layer with no transport behind it, for pure replay or explicit executors.
    pub fn detached(mode: SimulationMode) -> Self {
        Self {
            transport: None,
            mode: Mutex::new(mode),
            log: Arc::new(Mutex::new(RecordLog::default())),
            recording_path: None,
        }
    }

    /// Build from configuration, loading the recording file up front in replay mode.
    pub fn from_config(transport: Arc<dyn Transport>, config: SimulationConfig) -> Result<Self> {
        let mut layer = Self::new(transport, config.mode);
        layer.recording_path = config.recording_path;
        if let (SimulationMode::Replay(_), Some(path)) = (config.mode, &layer.recording_path) {
            layer.load_recordings(path)?;
        }
        Ok(layer)
    }

    pub fn mode(&self) -> SimulationMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: SimulationMode) {
        *self.mode.lock() = mode;
        tracing::info!(?mode, "simulation mode changed");
    }

    pub fn recording_path(&self) -> Option<&Path> {
        self.recording_path.as_deref()
    }

    pub async fn execute<F, Fut>(&self, call: Call, real: F) -> Result<Bytes>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        match self.mode() {
            SimulationMode::Disabled => real(call.request).await,
            SimulationMode::Recording => {
                let (id, timestamp_ms, started) = self.begin();
                let result = real(call.request.clone()).await;
                let outcome = match &result {
                    Ok(body) => RecordedOutcome::Response { body: body.clone() },
                    Err(error) => RecordedOutcome::Error {
                        error: error.clone(),
                    },
                };
                self.log.lock().commit(RecordEntry {
                    id,
                    timestamp_ms,
                    operation: call.operation,
                    key: call.key,
                    request: call.request,
                    outcome,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
                result
            }
            SimulationMode::Replay(timing) => {
                let entry = self.take_match(&call)?;
                pace(timing, entry.elapsed_ms).await;
                match entry.outcome {
                    RecordedOutcome::Response { body } => Ok(body),
                    RecordedOutcome::Error { error } => Err(error),
                    RecordedOutcome::Stream(_) => Err(Error::Simulation(format!(
                        "recording {} for {} is a stream, not a unary call",
                        entry.id, call.operation
                    ))),
                }
            }
        }
    }

    pub async fn execute_streaming<F, Fut>(&self, call: Call, real: F) -> Result<BidiStream>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = Result<BidiStream>>,
    {
        match self.mode() {
            SimulationMode::Disabled => real(call.request).await,
            SimulationMode::Recording => {
                let (id, timestamp_ms, started) = self.begin();
                let result = real(call.request.clone()).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut entry = RecordEntry {
                    id,
                    timestamp_ms,
                    operation: call.operation,
                    key: call.key,
                    request: call.request,
                    outcome: RecordedOutcome::Stream(StreamTranscript::default()),
                    elapsed_ms,
                };
                match result {
                    Ok(stream) => Ok(stream::record_stream(
                        stream,
                        Arc::clone(&self.log),
                        entry,
                        Instant::now(),
                    )),
                    Err(error) => {
                        entry.outcome = RecordedOutcome::Error {
                            error: error.clone(),
                        };
                        self.log.lock().commit(entry);
                        Err(error)
                    }
                }
            }
            SimulationMode::Replay(timing) => {
                let entry = self.take_match(&call)?;
                pace(timing, entry.elapsed_ms).await;
                match entry.outcome {
                    RecordedOutcome::Stream(transcript) => {
                        Ok(stream::replay_stream(transcript, timing))
                    }
                    RecordedOutcome::Error { error } => Err(error),
                    RecordedOutcome::Response { .. } => Err(Error::Simulation(format!(
                        "recording {} for {} is a unary call, not a stream",
                        entry.id, call.operation
                    ))),
                }
            }
        }
    }

    /// Unary call through the wrapped transport.
    pub async fn send(&self, path: &str, key: Option<&str>, body: Bytes) -> Result<Bytes> {
        let call = Call::new(path, key.map(str::to_string), body);
        let transport = self.transport.clone();
        self.execute(call, |request| async move {
            transport_or_err(transport, path)?.send(path, request).await
        })
        .await
    }

    /// Streaming call through the wrapped transport.
    pub async fn open_stream(
        &self,
        path: &str,
        key: Option<&str>,
        initial: Bytes,
    ) -> Result<BidiStream> {
        let call = Call::new(path, key.map(str::to_string), initial);
        let transport = self.transport.clone();
        self.execute_streaming(call, |request| async move {
            transport_or_err(transport, path)?
                .open_stream(path, request)
                .await
        })
        .await
    }

    /// Forget which entries replay has consumed.
    pub fn reset_replay(&self) {
        self.log.lock().reset_consumed();
    }

    /// Committed entries in id order. Streams still open are not included.
    pub fn recordings(&self) -> Vec<RecordEntry> {
        self.log.lock().entries()
    }

    pub fn clear_recordings(&self) {
        self.log.lock().replace(Vec::new());
    }

    pub fn save_recordings(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let entries = self.recordings();
        let count = entries.len();
        record::write_file(path, entries)?;
        tracing::info!(path = %path.display(), entries = count, "saved recordings");
        Ok(())
    }

    /// Replace the log with the file contents and clear consumption marks.
    pub fn load_recordings(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let entries = record::read_file(path)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "loaded recordings");
        self.log.lock().replace(entries);
        Ok(())
    }

    /// Save to the configured recording path, if there is one.
    pub fn persist(&self) -> Result<()> {
        match &self.recording_path {
            Some(path) => self.save_recordings(path),
            None => Ok(()),
        }
    }

    fn begin(&self) -> (u64, u64, Instant) {
        let id = self.log.lock().allocate_id();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();
        (id, timestamp_ms, Instant::now())
    }

    fn take_match(&self, call: &Call) -> Result<RecordEntry> {
        let entry = self
            .log
            .lock()
            .take_match(&call.operation, &call.request)
            .ok_or_else(|| {
                Error::Simulation(format!("no recording left for {}", call.operation))
            })?;
        if entry.request != call.request {
            tracing::debug!(
                operation = %call.operation,
                id = entry.id,
                "replaying entry with a different request body"
            );
        }
        Ok(entry)
    }
}

impl std::fmt::Debug for SimulationLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationLayer")
            .field("mode", &self.mode())
            .field("recording_path", &self.recording_path)
            .finish_non_exhaustive()
    }
}

fn transport_or_err(transport: Option<Arc<dyn Transport>>, path: &str) -> Result<Arc<dyn Transport>> {
    transport.ok_or_else(|| Error::Simulation(format!("no transport behind simulation for {path}")))
}

async fn pace(timing: ReplayTiming, recorded_ms: u64) {
    let delay = match timing {
        ReplayTiming::Instant => return,
        ReplayTiming::Realistic => Duration::from_millis(recorded_ms),
        ReplayTiming::Fixed(delay) => delay,
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
