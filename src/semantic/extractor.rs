//! Embedding extraction on top of an opaque inference engine.
//!
//! The engine is moved onto a dedicated worker thread when the extractor is
//! built. Every call goes through that thread, so the engine never sees two
//! concurrent invocations, and each call is bounded by a wall-clock budget.
//! A call that overruns the budget is abandoned: its late result is thrown
//! away and the caller gets [`ExtractionError::Timeout`].
//!
//! At most one call is handed to the worker at a time. While an abandoned
//! call is still running, new callers wait for the worker to go idle within
//! their own budget and time out without queueing anything.

use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::semantic::tokenizer::TokenSequence;

/// Side length of the square image the vision encoder expects
pub const IMAGE_SIZE: usize = 224;

/// Number of floats in a `[1, 3, IMAGE_SIZE, IMAGE_SIZE]` pixel tensor
pub const IMAGE_TENSOR_LEN: usize = 3 * IMAGE_SIZE * IMAGE_SIZE;

/// Default wall-clock budget for one inference call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Preprocessed input for one encoder call.
#[derive(Debug, Clone)]
pub enum ModelInput {
    /// NCHW pixel tensor of shape `[1, 3, IMAGE_SIZE, IMAGE_SIZE]`
    Image { pixels: Vec<f32> },
    /// Token ids and attention mask, both of shape `[1, CONTEXT_LENGTH]`
    Text(TokenSequence),
}

impl ModelInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelInput::Image { .. } => "image",
            ModelInput::Text(_) => "text",
        }
    }
}

/// Errors reported by an inference engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("inference failed: {0}")]
    Run(String),

    #[error("engine does not accept {0} input")]
    Unsupported(&'static str),
}

/// A loaded neural encoder. Implementations are not required to be `Sync`;
/// the extractor guarantees calls are serialized.
pub trait InferenceEngine: Send {
    /// Run the model and return the raw, unnormalized output vector.
    fn run(&mut self, input: &ModelInput) -> Result<Vec<f32>, EngineError>;
}

/// Errors that can occur while extracting an embedding.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("inference abandoned after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("embedding has zero norm")]
    ZeroNorm,

    #[error("embedding contains non-finite values")]
    NonFinite,

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("inference worker is not running")]
    WorkerGone,

    #[error("failed to start inference worker: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Request {
    input: ModelInput,
    reply: mpsc::SyncSender<Result<Vec<f32>, EngineError>>,
}

/// Whether the worker holds a call, shared between callers and the worker.
#[derive(Default)]
struct WorkerState {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl WorkerState {
    fn release(&self) {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.idle.notify_all();
    }
}

/// Marks the worker idle when dropped, including when the engine panics.
struct Release<'a>(&'a WorkerState);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Turns preprocessed tensors into L2-normalized embeddings.
pub struct EmbeddingExtractor {
    name: String,
    dimensions: usize,
    timeout: Duration,
    requests: Option<Mutex<mpsc::Sender<Request>>>,
    state: Arc<WorkerState>,
    worker: Option<JoinHandle<()>>,
}

impl EmbeddingExtractor {
    /// Move `engine` onto its own worker thread.
    ///
    /// # Arguments
    /// * `name` - Label used for the worker thread and log lines
    /// * `engine` - The loaded encoder, owned by the worker from now on
    /// * `dimensions` - Expected embedding length
    /// * `timeout` - Wall-clock budget of a single call
    pub fn spawn<E>(
        name: &str,
        engine: E,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, ExtractionError>
    where
        E: InferenceEngine + 'static,
    {
        let (tx, rx) = mpsc::channel::<Request>();
        let state = Arc::new(WorkerState::default());
        let mut engine = engine;

        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name(format!("inference-{name}"))
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let output = {
                        let _release = Release(&worker_state);
                        engine.run(&request.input)
                    };
                    // receiver is gone when the caller already gave up
                    let _ = request.reply.send(output);
                }
            })?;

        log::debug!("{name} encoder ready ({dimensions} dims, budget {timeout:?})");

        Ok(Self {
            name: name.to_string(),
            dimensions,
            timeout,
            requests: Some(Mutex::new(tx)),
            state,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the encoder and return a unit-length embedding.
    ///
    /// The budget covers time spent waiting for an abandoned call to finish.
    pub fn extract(&self, input: ModelInput) -> Result<Vec<f32>, ExtractionError> {
        let deadline = Instant::now() + self.timeout;
        self.claim_worker(deadline)?;

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        if let Err(err) = self.send(Request {
            input,
            reply: reply_tx,
        }) {
            self.state.release();
            return Err(err);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let raw = match reply_rx.recv_timeout(remaining) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("{} inference exceeded {:?}, abandoning", self.name, self.timeout);
                return Err(ExtractionError::Timeout(self.timeout));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ExtractionError::WorkerGone),
        };

        if raw.len() != self.dimensions {
            return Err(ExtractionError::DimensionMismatch {
                expected: self.dimensions,
                got: raw.len(),
            });
        }

        l2_normalize(raw)
    }

    /// Wait until the worker is idle and mark it busy, or give up at `deadline`.
    fn claim_worker(&self, deadline: Instant) -> Result<(), ExtractionError> {
        let mut busy = self
            .state
            .busy
            .lock()
            .map_err(|_| ExtractionError::WorkerGone)?;

        while *busy {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "{} encoder still busy with an abandoned call after {:?}",
                    self.name,
                    self.timeout
                );
                return Err(ExtractionError::Timeout(self.timeout));
            }
            busy = self
                .state
                .idle
                .wait_timeout(busy, remaining)
                .map_err(|_| ExtractionError::WorkerGone)?
                .0;
        }

        *busy = true;
        Ok(())
    }

    fn send(&self, request: Request) -> Result<(), ExtractionError> {
        self.requests
            .as_ref()
            .ok_or(ExtractionError::WorkerGone)?
            .lock()
            .map_err(|_| ExtractionError::WorkerGone)?
            .send(request)
            .map_err(|_| ExtractionError::WorkerGone)
    }

    pub fn extract_image(&self, pixels: Vec<f32>) -> Result<Vec<f32>, ExtractionError> {
        self.extract(ModelInput::Image { pixels })
    }

    pub fn extract_text(&self, tokens: TokenSequence) -> Result<Vec<f32>, ExtractionError> {
        self.extract(ModelInput::Text(tokens))
    }
}

impl Drop for EmbeddingExtractor {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        drop(self.requests.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} inference worker panicked", self.name);
            }
        }
    }
}

/// Scale a vector to unit Euclidean length.
pub fn l2_normalize(mut vector: Vec<f32>) -> Result<Vec<f32>, ExtractionError> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ExtractionError::NonFinite);
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() {
        return Err(ExtractionError::NonFinite);
    }
    if norm < f32::EPSILON {
        return Err(ExtractionError::ZeroNorm);
    }

    for value in vector.iter_mut() {
        *value /= norm;
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedEngine {
        output: Vec<f32>,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl InferenceEngine for FixedEngine {
        fn run(&mut self, _input: &ModelInput) -> Result<Vec<f32>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.output.clone())
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn run(&mut self, input: &ModelInput) -> Result<Vec<f32>, EngineError> {
            Err(EngineError::Unsupported(input.kind()))
        }
    }

    fn extractor(output: Vec<f32>, delay: Duration, timeout: Duration) -> EmbeddingExtractor {
        let dims = output.len();
        let engine = FixedEngine {
            output,
            calls: Arc::new(AtomicUsize::new(0)),
            delay,
        };
        EmbeddingExtractor::spawn("test", engine, dims, timeout).unwrap()
    }

    fn image() -> ModelInput {
        ModelInput::Image {
            pixels: vec![0.0; IMAGE_TENSOR_LEN],
        }
    }

    #[test]
    fn test_output_is_unit_length() {
        let ex = extractor(vec![3.0, 4.0, 0.0], Duration::ZERO, DEFAULT_TIMEOUT);
        let v = ex.extract(image()).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_vector_is_rejected() {
        let ex = extractor(vec![0.0, 0.0, 0.0], Duration::ZERO, DEFAULT_TIMEOUT);
        assert!(matches!(ex.extract(image()), Err(ExtractionError::ZeroNorm)));
    }

    #[test]
    fn test_non_finite_output_is_rejected() {
        assert!(matches!(
            l2_normalize(vec![1.0, f32::NAN]),
            Err(ExtractionError::NonFinite)
        ));
        assert!(matches!(
            l2_normalize(vec![f32::INFINITY, 1.0]),
            Err(ExtractionError::NonFinite)
        ));
    }

    #[test]
    fn test_slow_call_is_abandoned() {
        let ex = extractor(
            vec![1.0, 0.0],
            Duration::from_millis(300),
            Duration::from_millis(20),
        );
        let result = ex.extract(image());
        assert!(matches!(result, Err(ExtractionError::Timeout(_))));
    }

    #[test]
    fn test_worker_survives_abandoned_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = FixedEngine {
            output: vec![1.0, 1.0],
            calls: calls.clone(),
            delay: Duration::from_millis(100),
        };
        let ex = EmbeddingExtractor::spawn("test", engine, 2, Duration::from_millis(10)).unwrap();
        assert!(ex.extract(image()).is_err());
        drop(ex);
        // drop joins the worker, so the abandoned call has finished
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_calls_do_not_pile_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = FixedEngine {
            output: vec![1.0, 1.0],
            calls: calls.clone(),
            delay: Duration::from_millis(300),
        };
        let ex = EmbeddingExtractor::spawn("test", engine, 2, Duration::from_millis(20)).unwrap();

        for _ in 0..5 {
            assert!(matches!(ex.extract(image()), Err(ExtractionError::Timeout(_))));
        }
        // only the first call reached the engine
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        drop(ex);
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct SlowFirstEngine {
        calls: Arc<AtomicUsize>,
    }

    impl InferenceEngine for SlowFirstEngine {
        fn run(&mut self, _input: &ModelInput) -> Result<Vec<f32>, EngineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(150));
            }
            Ok(vec![0.0, 2.0])
        }
    }

    #[test]
    fn test_worker_is_reused_once_idle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = SlowFirstEngine {
            calls: calls.clone(),
        };
        let ex = EmbeddingExtractor::spawn("test", engine, 2, Duration::from_millis(50)).unwrap();

        assert!(matches!(ex.extract(image()), Err(ExtractionError::Timeout(_))));
        // still busy with the first call
        assert!(matches!(ex.extract(image()), Err(ExtractionError::Timeout(_))));

        std::thread::sleep(Duration::from_millis(200));
        let v = ex.extract(image()).unwrap();
        assert_eq!(v, vec![0.0, 1.0]);
        assert_eq!(ex.extract(image()).unwrap(), vec![0.0, 1.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let engine = FixedEngine {
            output: vec![1.0, 2.0, 3.0],
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        };
        let ex = EmbeddingExtractor::spawn("test", engine, 512, DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(
            ex.extract(image()),
            Err(ExtractionError::DimensionMismatch {
                expected: 512,
                got: 3
            })
        ));
    }

    #[test]
    fn test_engine_error_propagates() {
        let ex = EmbeddingExtractor::spawn("test", FailingEngine, 2, DEFAULT_TIMEOUT).unwrap();
        let err = ex.extract_text(TokenSequence::wrap(&[])).unwrap_err();
        assert!(matches!(err, ExtractionError::Engine(EngineError::Unsupported("text"))));
    }
}
