use std::ops::Range;
use std::sync::{Mutex, RwLock};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::api::{CancelToken, ClusterConfig, ClusterError, ClusterOutput, EngineStats};
use crate::barrier::Barrier;
use crate::clusters::Clusters;
use crate::dist_matrix::DistMatrix;
use crate::distance::euclidean;
use crate::partition::{LowerBounds, PartitionProgram, RowState};
use crate::row_cache::{RegenSchedule, RowCache};
use crate::row_source::RowSource;

/// Which pass the workers are currently running.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Round {
    /// Random-init pass: every row draws a cluster and accumulates itself.
    InitRandom,
    /// k-means++ distance pass against the newest center.
    KmsppDist,
    /// Main E-step (full scan on the first pass after a deterministic
    /// init, pruned afterwards).
    EStep,
}

/// Mutable run state. Written only by the worker that crosses the barrier
/// (and by the driver between passes); workers snapshot what they need at
/// pass entry.
pub struct Ctrl {
    pub round: Round,
    pub prune_init: bool,
    pub label_only: bool,
    pub iter: usize,
    pub done: bool,
    pub converged: bool,
    pub failed: Option<ClusterError>,
    pub kmspp_idx: usize,
    pub kmspp_next: Option<usize>,
    pub schedule: Option<RegenSchedule>,
    pub rng: StdRng,
    pub stats: EngineStats,
}

/// Rows `start..end` handled by worker `w`; contiguous and stable for the
/// whole run.
pub fn partition_range(nrows: usize, workers: usize, w: usize) -> Range<usize> {
    (w * nrows / workers)..((w + 1) * nrows / workers)
}

pub fn owner_of(nrows: usize, workers: usize, row_id: usize) -> usize {
    (0..workers)
        .find(|&w| partition_range(nrows, workers, w).contains(&row_id))
        .unwrap_or(0)
}

/// The pruning k-means engine.
///
/// One instance per run. Shared state (centroids, half-distance table, row
/// cache, control block) is guarded so that workers read it during a pass
/// while the single barrier-crossing worker mutates it between passes.
/// Per-row state and the partition accumulators are sharded per worker and
/// only ever touched by their owner within a pass.
pub struct Engine<'a, B: LowerBounds> {
    pub source: &'a dyn RowSource,
    pub cfg: &'a ClusterConfig,
    pub nrows: usize,
    pub ncols: usize,
    pub nclust: usize,
    pub workers: usize,
    pub cache_rows: usize,
    pub clusters: RwLock<Clusters>,
    pub dist: RwLock<DistMatrix>,
    pub cache: Option<RwLock<RowCache>>,
    pub programs: Vec<Mutex<PartitionProgram>>,
    pub states: Vec<Mutex<Vec<RowState<B>>>>,
    pub barrier: Barrier,
    pub ctrl: Mutex<Ctrl>,
    pub cancel: CancelToken,
}

impl<'a, B: LowerBounds> Engine<'a, B> {
    pub fn new(source: &'a dyn RowSource, cfg: &'a ClusterConfig, cancel: CancelToken) -> Self {
        let nrows = source.num_rows();
        let ncols = source.num_cols();
        let nclust = cfg.k;
        let workers = cfg.workers.min(nrows).max(1);

        let cache_rows = cfg.cache_bytes / (ncols * std::mem::size_of::<f64>());
        let cache = (cfg.cache_bytes > 0 && cache_rows > 0)
            .then(|| RwLock::new(RowCache::new(workers, ncols, cache_rows)));
        let schedule = cache
            .is_some()
            .then(|| RegenSchedule::new(cfg.cache_start_interval));

        let programs = (0..workers)
            .map(|_| Mutex::new(PartitionProgram::new(nclust, ncols)))
            .collect();
        let states = (0..workers)
            .map(|w| {
                let len = partition_range(nrows, workers, w).len();
                Mutex::new((0..len).map(|_| RowState::new(nclust)).collect())
            })
            .collect();

        Engine {
            source,
            cfg,
            nrows,
            ncols,
            nclust,
            workers,
            cache_rows,
            clusters: RwLock::new(Clusters::new(nclust, ncols)),
            dist: RwLock::new(DistMatrix::new(nclust)),
            cache,
            programs,
            states,
            barrier: Barrier::new(workers),
            ctrl: Mutex::new(Ctrl {
                round: Round::EStep,
                prune_init: false,
                label_only: false,
                iter: 0,
                done: false,
                converged: false,
                failed: None,
                kmspp_idx: 0,
                kmspp_next: None,
                schedule,
                rng: StdRng::seed_from_u64(cfg.seed),
                stats: EngineStats::default(),
            }),
            cancel,
        }
    }

    pub fn run(self) -> Result<ClusterOutput, ClusterError> {
        self.init_phase()?;

        if self.cfg.max_iters == 0 {
            {
                let mut ctrl = self.ctrl.lock().unwrap();
                ctrl.prune_init = true;
                ctrl.label_only = true;
            }
            if !self.cancel.is_cancelled() {
                self.run_pass();
            }
            return self.finish();
        }

        loop {
            {
                let ctrl = self.ctrl.lock().unwrap();
                if ctrl.done || ctrl.failed.is_some() {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.run_pass();
        }
        self.finish()
    }

    /// Drive every worker through one pass over its partition. The last
    /// worker to finish crosses the barrier and runs the reduction for the
    /// round.
    pub fn run_pass(&self) {
        (0..self.workers)
            .into_par_iter()
            .for_each(|w| self.worker_pass(w));
    }

    fn worker_pass(&self, w: usize) {
        let (round, prune_init, kmspp_idx) = {
            let ctrl = self.ctrl.lock().unwrap();
            (ctrl.round, ctrl.prune_init, ctrl.kmspp_idx)
        };
        let range = partition_range(self.nrows, self.workers, w);
        {
            let clusters = self.clusters.read().unwrap();
            let dist = self.dist.read().unwrap();
            let cache_guard = self.cache.as_ref().map(|c| c.read().unwrap());
            let cache = cache_guard.as_deref();
            let mut prog = self.programs[w].lock().unwrap();
            let mut states = self.states[w].lock().unwrap();
            // Worker-local stream; stable for a given seed and worker count.
            let mut rng = StdRng::seed_from_u64(self.cfg.seed.wrapping_add(w as u64 + 1));

            for row_id in range.clone() {
                if self.cancel.is_cancelled() {
                    break;
                }
                let st = &mut states[row_id - range.start];
                let res = match round {
                    Round::InitRandom => {
                        self.init_random_row(w, row_id, st, &mut prog, cache, &mut rng)
                    }
                    Round::KmsppDist => self.kmspp_dist_row(
                        w, row_id, kmspp_idx, st, &mut prog, &clusters, &dist, cache,
                    ),
                    Round::EStep => self.estep_row(
                        w, row_id, prune_init, st, &mut prog, &clusters, &dist, cache,
                    ),
                };
                if let Err(e) = res {
                    self.fail(e);
                    break;
                }
            }
        }
        if self.barrier.ping() {
            match round {
                Round::EStep => self.m_step(),
                Round::InitRandom => self.init_m_step(),
                Round::KmsppDist => self.kmspp_select(),
            }
        }
    }

    /// Materialize a row through the cache. A miss falls back to the
    /// source, registers the row with the calling worker's shard, and is
    /// charged to the partition's I/O counter when `count_request` is set.
    pub fn read_row<'r>(
        &'r self,
        w: usize,
        row_id: usize,
        cache: Option<&'r RowCache>,
        prog: &mut PartitionProgram,
        count_request: bool,
    ) -> Result<&'r [f64], ClusterError> {
        if let Some(cache) = cache {
            if let Some(row) = cache.get(w, row_id) {
                return Ok(row);
            }
        }
        let row = self.source.row(row_id)?;
        prog.fetched = true;
        if count_request {
            prog.io_reqs += 1;
        }
        if let Some(cache) = cache {
            cache.try_insert(w, row_id, row);
        }
        Ok(row)
    }

    /// Per-row E-step dispatch.
    #[allow(clippy::too_many_arguments)]
    fn estep_row(
        &self,
        w: usize,
        row_id: usize,
        prune_init: bool,
        st: &mut RowState<B>,
        prog: &mut PartitionProgram,
        clusters: &Clusters,
        dist: &DistMatrix,
        cache: Option<&RowCache>,
    ) -> Result<(), ClusterError> {
        let old = st.cluster;

        if prune_init {
            // Bounds are not populated yet: full K-way scan, first
            // minimizer wins.
            let row = self.read_row(w, row_id, cache, prog, false)?;
            let mut best = f64::INFINITY;
            let mut best_c = 0;
            for c in 0..self.nclust {
                let d = euclidean(row, clusters.mean(c));
                if B::TRACKED {
                    st.lb.set(c, d);
                }
                if d < best {
                    best = d;
                    best_c = c;
                }
            }
            st.ub = best;
            st.cluster = Some(best_c);
            prog.clusters.add_row(best_c, row);
            if old != st.cluster {
                prog.changed += 1;
            }
            return Ok(());
        }

        let assigned = st.cluster.ok_or_else(|| {
            ClusterError::Invariant(format!("row {} entered pruning pass unassigned", row_id))
        })?;

        // Loosen every bound by the centroid drift before any test.
        if B::TRACKED {
            st.lb.loosen(clusters.prev_dists());
        }
        st.ub += clusters.prev_dist(assigned);

        if st.ub <= clusters.s_val(assigned) {
            return Ok(()); // assignment cannot change; no I/O
        }

        let row = self.read_row(w, row_id, cache, prog, true)?;
        let mut recalculated = false;
        let mut a = assigned;
        for c in 0..self.nclust {
            if c == a {
                continue;
            }
            if st.ub <= dist.get(a, c) {
                continue;
            }
            if B::TRACKED && st.ub <= st.lb.get(c) {
                continue;
            }
            // Tighten the upper bound to the exact distance once per call.
            if !recalculated {
                let d = euclidean(row, clusters.mean(a));
                st.ub = d;
                if B::TRACKED {
                    st.lb.set(a, d);
                }
                recalculated = true;
            }
            if st.ub <= dist.get(a, c) {
                continue;
            }
            if B::TRACKED && st.lb.get(c) >= st.ub {
                continue;
            }
            let d = euclidean(row, clusters.mean(c));
            if B::TRACKED {
                st.lb.set(c, d);
            }
            if d < st.ub {
                st.ub = d;
                a = c;
            }
        }
        st.cluster = Some(a);
        if old != st.cluster {
            prog.changed += 1;
            prog.clusters.swap_membership(row, assigned, a);
        }
        Ok(())
    }

    /// Reduction run by the barrier-crossing worker at the end of an
    /// E-step pass.
    fn m_step(&self) {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.failed.is_some() || self.cancel.is_cancelled() {
            return; // iteration abandoned; no partial update
        }

        if ctrl.label_only {
            for prog in &self.programs {
                prog.lock().unwrap().reset();
            }
            ctrl.done = true;
            return;
        }

        let mut clusters = self.clusters.write().unwrap();
        let mut dist = self.dist.write().unwrap();

        clusters.set_prev_means();
        if ctrl.prune_init {
            clusters.clear();
        } else {
            for c in 0..self.nclust {
                clusters.unfinalize(c);
            }
        }

        let mut changed = 0usize;
        let mut fetched = false;
        for prog in &self.programs {
            let mut prog = prog.lock().unwrap();
            clusters.merge(&prog.clusters);
            changed += prog.changed;
            ctrl.stats.io_requests += prog.io_reqs;
            fetched |= prog.fetched;
            prog.reset();
        }

        if changed > self.nrows {
            ctrl.failed = Some(ClusterError::Invariant(format!(
                "{} rows changed cluster but the matrix has {}",
                changed, self.nrows
            )));
            return;
        }

        let mut total_members = 0i64;
        for c in 0..self.nclust {
            clusters.finalize(c);
            clusters.update_prev_dist(c);
            total_members += clusters.num_members(c);
        }
        if total_members != self.nrows as i64 {
            ctrl.failed = Some(ClusterError::Invariant(format!(
                "cluster membership totals {} for {} rows",
                total_members, self.nrows
            )));
            return;
        }

        dist.compute(&mut clusters);
        drop(dist);
        drop(clusters);

        self.manage_cache(&mut ctrl, fetched);

        ctrl.iter += 1;
        ctrl.stats.iterations = ctrl.iter;
        ctrl.stats.changed_last_iter = changed;
        let frac = changed as f64 / self.nrows as f64;
        info!("iteration {}: {} rows changed cluster", ctrl.iter, changed);

        if changed == 0 || frac <= self.cfg.tolerance {
            ctrl.done = true;
            ctrl.converged = true;
        } else if ctrl.iter > self.cfg.max_iters {
            ctrl.done = true;
        } else if self.cfg.prune {
            ctrl.prune_init = false;
        }
    }

    /// Advance the cache schedule at the end of a pass: regenerate when
    /// due, otherwise freeze a generation that just finished filling.
    pub fn manage_cache(&self, ctrl: &mut Ctrl, fetched: bool) {
        let Some(cache_lock) = self.cache.as_ref() else {
            return;
        };
        let Some(sched) = ctrl.schedule.as_mut() else {
            return;
        };
        let due = sched.advance(fetched);
        let io_iter = sched.io_iter();
        let regens = sched.regens() as usize;
        if due {
            info!("regenerating row cache at io iteration {}", io_iter);
            let mut cache = cache_lock.write().unwrap();
            ctrl.stats.cache_hits += cache.hits();
            *cache = RowCache::new(self.workers, self.ncols, self.cache_rows);
            ctrl.stats.cache_regens = regens;
        } else {
            let mut cache = cache_lock.write().unwrap();
            if !cache.is_frozen() {
                debug!("freezing row cache generation");
                cache.build_index();
            }
        }
    }

    pub fn fail(&self, err: ClusterError) {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.failed.is_none() {
            ctrl.failed = Some(err);
        }
    }

    /// Assemble the result from the last completed reduction.
    pub fn finish(&self) -> Result<ClusterOutput, ClusterError> {
        {
            let mut ctrl = self.ctrl.lock().unwrap();
            if let Some(e) = ctrl.failed.take() {
                return Err(e);
            }
        }

        let mut assignments = Vec::with_capacity(self.nrows);
        for shard in &self.states {
            let states = shard.lock().unwrap();
            for st in states.iter() {
                match st.cluster {
                    Some(c) => assignments.push(c),
                    None if self.cancel.is_cancelled() => return Err(ClusterError::Cancelled),
                    None => {
                        return Err(ClusterError::Invariant(
                            "row left unassigned after clustering".into(),
                        ))
                    }
                }
            }
        }

        let mut sizes = vec![0usize; self.nclust];
        for &a in &assignments {
            sizes[a] += 1;
        }

        let ctrl = self.ctrl.lock().unwrap();
        let clusters = self.clusters.read().unwrap();
        let mut stats = ctrl.stats.clone();
        if let Some(cache) = &self.cache {
            stats.cache_hits += cache.read().unwrap().hits();
        }
        Ok(ClusterOutput {
            assignments,
            sizes,
            centroids: clusters.means().clone(),
            iters: ctrl.iter,
            converged: ctrl.converged,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterConfig, InitMethod};
    use crate::partition::NoBounds;
    use crate::row_source::MemRows;
    use ndarray::Array2;

    fn line_source(n: usize) -> MemRows {
        MemRows::from_rows((0..n).map(|i| vec![i as f64]).collect())
    }

    #[test]
    fn partition_ranges_cover_all_rows_exactly_once() {
        for (nrows, workers) in [(10, 3), (7, 7), (100, 8), (3, 5)] {
            let mut seen = vec![0u32; nrows];
            for w in 0..workers {
                for r in partition_range(nrows, workers, w) {
                    seen[r] += 1;
                    assert_eq!(owner_of(nrows, workers, r), w);
                }
            }
            assert!(seen.iter().all(|&c| c == 1));
        }
    }

    // Slowly separating line data: boundaries keep moving for many
    // iterations, so cancelling after three leaves an unconverged run.
    #[test]
    fn cancel_between_iterations_returns_last_completed_state() {
        let source = line_source(60);
        let centers = Array2::from_shape_vec((3, 1), vec![0.0, 1.0, 2.0]).unwrap();
        let cfg = ClusterConfig::new(3)
            .with_init(InitMethod::Given(centers))
            .with_max_iters(50)
            .with_workers(2);
        let cancel = CancelToken::new();
        let engine = Engine::<NoBounds>::new(&source, &cfg, cancel.clone());
        engine.init_phase().unwrap();
        for _ in 0..3 {
            engine.run_pass();
        }

        let snap_centroids = engine.clusters.read().unwrap().means().clone();
        let mut snap_assign = Vec::new();
        for shard in &engine.states {
            for st in shard.lock().unwrap().iter() {
                snap_assign.push(st.cluster.unwrap());
            }
        }
        {
            let ctrl = engine.ctrl.lock().unwrap();
            assert_eq!(ctrl.iter, 3);
            assert!(!ctrl.done, "test data converged too early");
        }

        cancel.cancel();
        let out = engine.finish().unwrap();
        assert_eq!(out.iters, 3);
        assert!(!out.converged);
        assert_eq!(out.centroids, snap_centroids);
        assert_eq!(out.assignments, snap_assign);
    }

    #[test]
    fn cancelled_pass_performs_no_reduction() {
        let source = line_source(40);
        let centers = Array2::from_shape_vec((2, 1), vec![0.0, 1.0]).unwrap();
        let cfg = ClusterConfig::new(2)
            .with_init(InitMethod::Given(centers))
            .with_max_iters(50)
            .with_workers(2);
        let cancel = CancelToken::new();
        let engine = Engine::<NoBounds>::new(&source, &cfg, cancel.clone());
        engine.init_phase().unwrap();
        engine.run_pass();
        let centroids_after_one = engine.clusters.read().unwrap().means().clone();

        cancel.cancel();
        engine.run_pass();
        assert_eq!(engine.ctrl.lock().unwrap().iter, 1);
        assert_eq!(
            engine.clusters.read().unwrap().means(),
            &centroids_after_one
        );
    }
}
