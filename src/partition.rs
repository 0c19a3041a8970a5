use crate::clusters::Clusters;

/// Storage seam for the per-row, per-cluster lower bounds.
///
/// The full triangle-inequality variant keeps K lower bounds per row, which
/// buys extra pruning tests at a K x N memory cost. The minimized variant
/// stores nothing and relies on the upper bound and the half-distance table
/// alone. Both are zero-cost monomorphizations of the same engine.
pub trait LowerBounds: Send {
    const TRACKED: bool;

    fn new(nclust: usize) -> Self;

    fn get(&self, c: usize) -> f64;

    fn set(&mut self, c: usize, d: f64);

    /// Loosen every bound by the matching centroid drift after an update.
    fn loosen(&mut self, drifts: &[f64]);
}

/// Per-cluster lower bounds for the full variant.
pub struct FullBounds(Vec<f64>);

impl LowerBounds for FullBounds {
    const TRACKED: bool = true;

    fn new(nclust: usize) -> Self {
        FullBounds(vec![0.0; nclust])
    }

    #[inline]
    fn get(&self, c: usize) -> f64 {
        self.0[c]
    }

    #[inline]
    fn set(&mut self, c: usize, d: f64) {
        self.0[c] = d;
    }

    fn loosen(&mut self, drifts: &[f64]) {
        for (lb, drift) in self.0.iter_mut().zip(drifts) {
            if *drift > 0.0 {
                *lb = (*lb - drift).max(0.0);
            }
        }
    }
}

/// Bound-free stand-in for the minimized variant.
pub struct NoBounds;

impl LowerBounds for NoBounds {
    const TRACKED: bool = false;

    fn new(_nclust: usize) -> Self {
        NoBounds
    }

    #[inline]
    fn get(&self, _c: usize) -> f64 {
        0.0
    }

    #[inline]
    fn set(&mut self, _c: usize, _d: f64) {}

    fn loosen(&mut self, _drifts: &[f64]) {}
}

/// Per-row clustering state, owned by the worker the row is partitioned to.
pub struct RowState<B> {
    /// Current assignment; `None` until a first assignment happens.
    pub cluster: Option<usize>,
    /// Upper bound on the distance to the assigned centroid.
    pub ub: f64,
    /// Distance to the nearest already-chosen center during k-means++.
    pub kmspp_dist: f64,
    pub lb: B,
}

impl<B: LowerBounds> RowState<B> {
    pub fn new(nclust: usize) -> Self {
        RowState {
            cluster: None,
            ub: f64::INFINITY,
            kmspp_dist: f64::INFINITY,
            lb: B::new(nclust),
        }
    }
}

/// Per-worker partial state for one pass: a private accumulator plus the
/// counters the reduction folds into the globals. All per-row mutations from
/// the engine land here, never on the shared state.
pub struct PartitionProgram {
    pub clusters: Clusters,
    pub changed: usize,
    pub io_reqs: usize,
    pub fetched: bool,
    /// k-means++ partial cumulative distance sum.
    pub cuml_dist: f64,
}

impl PartitionProgram {
    pub fn new(nclust: usize, ncols: usize) -> Self {
        PartitionProgram {
            clusters: Clusters::new(nclust, ncols),
            changed: 0,
            io_reqs: 0,
            fetched: false,
            cuml_dist: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.clusters.clear();
        self.changed = 0;
        self.io_reqs = 0;
        self.fetched = false;
        self.cuml_dist = 0.0;
    }
}
