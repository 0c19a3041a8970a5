use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Engine;
use crate::partition::{FullBounds, NoBounds};
use crate::row_source::RowSource;

/// Errors surfaced by a clustering run.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Rejected parameters; reported before any iteration runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Row source failure; the iteration in flight is abandoned.
    #[error("row source I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupted internal state. Not recoverable.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    /// Cancellation arrived before the first iteration completed, so there
    /// is no partial result to hand back.
    #[error("cancelled before any iteration completed")]
    Cancelled,

    #[error("result codec failure: {0}")]
    Codec(String),
}

/// How the initial centroids are produced.
#[derive(Clone, Debug)]
pub enum InitMethod {
    /// Assign every row to a uniformly random cluster, then average.
    Random,
    /// K distinct rows, drawn uniformly, become the centers.
    Forgy,
    /// D²-weighted sequential center selection (k-means++).
    PlusPlus,
    /// Caller-supplied K x D centroid matrix.
    Given(Array2<f64>),
}

/// Configuration for one clustering run.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Number of clusters (K).
    pub k: usize,

    pub init: InitMethod,

    /// Upper limit on pruning iterations; the first full-scan pass after a
    /// deterministic init is not counted against it. `0` means label-only:
    /// assign rows to the initial centroids and stop.
    pub max_iters: usize,

    /// Converged once the fraction of rows that changed cluster in an
    /// iteration drops to this value or below. In `[0, 1]`.
    pub tolerance: f64,

    /// Seed for every random draw the run makes.
    pub seed: u64,

    /// Number of logical workers (row partitions).
    pub workers: usize,

    /// Row cache budget in bytes; `0` disables the cache.
    pub cache_bytes: usize,

    /// Starting regeneration interval for the row cache, in io-iterations.
    pub cache_start_interval: u32,

    /// Track per-cluster lower bounds (the full triangle variant). Costs
    /// K extra doubles per row, prunes more.
    pub full_bounds: bool,

    /// Disable to force a full K-way scan every iteration. Mainly a
    /// debugging aid; the result is identical either way.
    pub prune: bool,
}

impl ClusterConfig {
    pub fn new(k: usize) -> Self {
        ClusterConfig {
            k,
            init: InitMethod::Random,
            max_iters: 100,
            tolerance: 0.0,
            seed: 42,
            workers: rayon::current_num_threads().max(1),
            cache_bytes: 0,
            cache_start_interval: 5,
            full_bounds: false,
            prune: true,
        }
    }

    pub fn with_init(mut self, init: InitMethod) -> Self {
        self.init = init;
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cache_bytes(mut self, cache_bytes: usize) -> Self {
        self.cache_bytes = cache_bytes;
        self
    }

    pub fn with_cache_start_interval(mut self, interval: u32) -> Self {
        self.cache_start_interval = interval;
        self
    }

    pub fn with_full_bounds(mut self, full_bounds: bool) -> Self {
        self.full_bounds = full_bounds;
        self
    }

    pub fn with_pruning(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }
}

/// Counters accumulated over a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Completed pruning iterations.
    pub iterations: usize,
    /// Rows that changed cluster in the final iteration.
    pub changed_last_iter: usize,
    /// Row fetches issued from the steady-state pruning path.
    pub io_requests: usize,
    pub cache_hits: usize,
    pub cache_regens: usize,
}

/// Finished clustering: assignments, per-cluster sizes, the centroid
/// matrix, and how the run ended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterOutput {
    pub assignments: Vec<usize>,
    pub sizes: Vec<usize>,
    pub centroids: Array2<f64>,
    pub iters: usize,
    pub converged: bool,
    pub stats: EngineStats,
}

impl ClusterOutput {
    /// Persist the result with bincode.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ClusterError> {
        let encoded = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ClusterError::Codec(format!("encode: {}", e)))?;
        let mut file = File::create(path)?;
        file.write_all(&encoded)?;
        Ok(())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let mut buffer = Vec::new();
        File::open(path)?.read_to_end(&mut buffer)?;
        let (out, _) = bincode::serde::decode_from_slice(&buffer, bincode::config::standard())
            .map_err(|e| ClusterError::Codec(format!("decode: {}", e)))?;
        Ok(out)
    }
}

/// Cooperative cancellation handle. Clone it, hand one side to the run and
/// trip it from anywhere; the engine checks it at every per-row entry and
/// before each reduction.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cluster the rows of `source` into `cfg.k` groups.
pub fn cluster<S: RowSource>(source: &S, cfg: &ClusterConfig) -> Result<ClusterOutput, ClusterError> {
    cluster_cancellable(source, cfg, CancelToken::new())
}

/// [`cluster`], but observing `cancel`. A run cancelled after at least one
/// completed iteration returns the last completed iteration's state with
/// `converged = false`.
pub fn cluster_cancellable<S: RowSource>(
    source: &S,
    cfg: &ClusterConfig,
    cancel: CancelToken,
) -> Result<ClusterOutput, ClusterError> {
    validate(source, cfg)?;
    let source: &dyn RowSource = source;
    if cfg.full_bounds {
        Engine::<FullBounds>::new(source, cfg, cancel).run()
    } else {
        Engine::<NoBounds>::new(source, cfg, cancel).run()
    }
}

fn validate<S: RowSource>(source: &S, cfg: &ClusterConfig) -> Result<(), ClusterError> {
    let nrows = source.num_rows();
    let ncols = source.num_cols();

    if ncols == 0 {
        return Err(ClusterError::Config("row dimension must be positive".into()));
    }
    if nrows == 0 {
        return Err(ClusterError::Config("row source is empty".into()));
    }
    if cfg.k < 2 {
        return Err(ClusterError::Config(format!(
            "k must be at least 2, got {}",
            cfg.k
        )));
    }
    if cfg.k > nrows {
        return Err(ClusterError::Config(format!(
            "k = {} exceeds the number of rows ({})",
            cfg.k, nrows
        )));
    }
    if !(0.0..=1.0).contains(&cfg.tolerance) {
        return Err(ClusterError::Config(format!(
            "tolerance must be in [0, 1], got {}",
            cfg.tolerance
        )));
    }
    if cfg.workers == 0 {
        return Err(ClusterError::Config("workers must be positive".into()));
    }
    if let InitMethod::Given(centers) = &cfg.init {
        if centers.dim() != (cfg.k, ncols) {
            return Err(ClusterError::Config(format!(
                "supplied centers are {:?}, expected ({}, {})",
                centers.dim(),
                cfg.k,
                ncols
            )));
        }
    }
    Ok(())
}
