use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::Rng;

use crate::api::{ClusterError, InitMethod};
use crate::clusters::Clusters;
use crate::dist_matrix::DistMatrix;
use crate::distance::euclidean;
use crate::engine::{owner_of, partition_range, Engine, Round};
use crate::partition::{LowerBounds, PartitionProgram, RowState};
use crate::row_cache::RowCache;

/// Draw K distinct row ids uniformly, mapping each to its cluster index.
/// Rejection sampling: duplicates are redrawn so exactly K centers result.
pub fn forgy_ids(rng: &mut StdRng, nclust: usize, nrows: usize) -> HashMap<usize, usize> {
    let mut picked = HashMap::with_capacity(nclust);
    let mut next_cluster = 0;
    while next_cluster < nclust {
        let id = rng.gen_range(0..nrows);
        if let Entry::Vacant(e) = picked.entry(id) {
            e.insert(next_cluster);
            next_cluster += 1;
        }
    }
    picked
}

impl<'a, B: LowerBounds> Engine<'a, B> {
    /// Produce the initial centroids and leave the engine ready for the
    /// main E-step rounds.
    pub fn init_phase(&self) -> Result<(), ClusterError> {
        match &self.cfg.init {
            InitMethod::Given(centers) => {
                info!("using {} caller-supplied centers", self.nclust);
                let mut clusters = self.clusters.write().unwrap();
                for c in 0..self.nclust {
                    clusters.set_mean(c, centers.row(c).to_slice().unwrap());
                }
                let mut dist = self.dist.write().unwrap();
                dist.compute(&mut clusters);
                drop(dist);
                drop(clusters);
                self.ctrl.lock().unwrap().prune_init = true;
            }
            InitMethod::Forgy => self.init_forgy()?,
            InitMethod::Random => self.init_random()?,
            InitMethod::PlusPlus => self.init_plusplus()?,
        }
        self.ctrl.lock().unwrap().round = Round::EStep;
        Ok(())
    }

    fn init_forgy(&self) -> Result<(), ClusterError> {
        let picked = {
            let mut ctrl = self.ctrl.lock().unwrap();
            forgy_ids(&mut ctrl.rng, self.nclust, self.nrows)
        };
        info!("forgy init: {} distinct rows drawn as centers", self.nclust);

        let mut clusters = self.clusters.write().unwrap();
        for (&row_id, &c) in &picked {
            let row = self.source.row(row_id)?;
            clusters.set_mean(c, row);
        }
        let mut dist = self.dist.write().unwrap();
        dist.compute(&mut clusters);
        drop(dist);
        drop(clusters);

        self.ctrl.lock().unwrap().prune_init = true;
        Ok(())
    }

    fn init_random(&self) -> Result<(), ClusterError> {
        info!("random init: assigning every row a uniform cluster");
        self.ctrl.lock().unwrap().round = Round::InitRandom;
        self.run_pass();

        let mut ctrl = self.ctrl.lock().unwrap();
        if let Some(e) = ctrl.failed.take() {
            return Err(e);
        }
        // Bounds start at infinity, so the first E-step recomputes
        // everything; no dedicated full-scan round is needed unless
        // pruning is disabled outright.
        ctrl.prune_init = !self.cfg.prune;
        Ok(())
    }

    fn init_plusplus(&self) -> Result<(), ClusterError> {
        let first = {
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.rng.gen_range(0..self.nrows)
        };
        info!("k-means++ init: row {} is the first center", first);
        self.apply_center(first, 0)?;

        for c in 1..self.nclust {
            {
                let mut clusters = self.clusters.write().unwrap();
                let mut dist = self.dist.write().unwrap();
                dist.compute(&mut clusters);
            }
            self.ctrl.lock().unwrap().round = Round::KmsppDist;
            self.run_pass();

            let next = {
                let mut ctrl = self.ctrl.lock().unwrap();
                if let Some(e) = ctrl.failed.take() {
                    return Err(e);
                }
                ctrl.kmspp_next.take()
            };
            let Some(next) = next else {
                return Err(if self.cancel.is_cancelled() {
                    ClusterError::Cancelled
                } else {
                    ClusterError::Invariant("k-means++ selection produced no center".into())
                });
            };
            self.apply_center(next, c)?;
        }

        {
            let mut clusters = self.clusters.write().unwrap();
            let mut dist = self.dist.write().unwrap();
            dist.compute(&mut clusters);
        }
        self.ctrl.lock().unwrap().prune_init = true;
        Ok(())
    }

    /// Install row `row_id` as center `c` and mark the row as its own
    /// cluster member with a zero distance.
    fn apply_center(&self, row_id: usize, c: usize) -> Result<(), ClusterError> {
        let row = self.source.row(row_id)?;
        self.clusters.write().unwrap().set_mean(c, row);

        let w = owner_of(self.nrows, self.workers, row_id);
        let start = partition_range(self.nrows, self.workers, w).start;
        let mut states = self.states[w].lock().unwrap();
        let st = &mut states[row_id - start];
        st.cluster = Some(c);
        st.ub = 0.0;
        st.kmspp_dist = 0.0;
        drop(states);

        self.ctrl.lock().unwrap().kmspp_idx = c;
        Ok(())
    }

    /// Random-init per-row step: draw a cluster and accumulate.
    pub fn init_random_row(
        &self,
        w: usize,
        row_id: usize,
        st: &mut RowState<B>,
        prog: &mut PartitionProgram,
        cache: Option<&RowCache>,
        rng: &mut StdRng,
    ) -> Result<(), ClusterError> {
        let row = self.read_row(w, row_id, cache, prog, false)?;
        let c = rng.gen_range(0..self.nclust);
        st.cluster = Some(c);
        prog.clusters.add_row(c, row);
        Ok(())
    }

    /// k-means++ distance phase for one row: keep the distance to the
    /// nearest already-chosen center current and feed the partition's
    /// cumulative sum.
    #[allow(clippy::too_many_arguments)]
    pub fn kmspp_dist_row(
        &self,
        w: usize,
        row_id: usize,
        kmspp_idx: usize,
        st: &mut RowState<B>,
        prog: &mut PartitionProgram,
        clusters: &Clusters,
        dist: &DistMatrix,
        cache: Option<&RowCache>,
    ) -> Result<(), ClusterError> {
        if let Some(a) = st.cluster {
            // Half-distance test against the newest center: the stored
            // distance cannot improve, so skip the computation.
            if st.kmspp_dist <= dist.get(kmspp_idx, a) {
                prog.cuml_dist += st.kmspp_dist;
                return Ok(());
            }
        }
        let row = self.read_row(w, row_id, cache, prog, false)?;
        let d = euclidean(row, clusters.mean(kmspp_idx));
        if d < st.kmspp_dist {
            st.kmspp_dist = d;
            st.cluster = Some(kmspp_idx);
            st.ub = d;
        }
        prog.cuml_dist += st.kmspp_dist;
        Ok(())
    }

    /// Reduction for the random-init pass: average the random memberships
    /// into the first centroids.
    pub fn init_m_step(&self) {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.failed.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let mut clusters = self.clusters.write().unwrap();
        let mut dist = self.dist.write().unwrap();

        clusters.set_prev_means();
        clusters.clear();
        let mut fetched = false;
        for prog in &self.programs {
            let mut prog = prog.lock().unwrap();
            clusters.merge(&prog.clusters);
            fetched |= prog.fetched;
            prog.reset();
        }
        for c in 0..self.nclust {
            clusters.finalize(c);
            clusters.update_prev_dist(c);
        }
        dist.compute(&mut clusters);
        drop(dist);
        drop(clusters);

        self.manage_cache(&mut ctrl, fetched);
    }

    /// D²-weighted selection of the next k-means++ center, run by the
    /// barrier-crossing worker at the end of a distance pass.
    pub fn kmspp_select(&self) {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.failed.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let mut total = 0.0;
        let mut fetched = false;
        for prog in &self.programs {
            let mut prog = prog.lock().unwrap();
            total += prog.cuml_dist;
            fetched |= prog.fetched;
            prog.reset();
        }
        self.manage_cache(&mut ctrl, fetched);

        if total <= 0.0 {
            ctrl.failed = Some(ClusterError::Config(
                "k-means++ cumulative distance is zero; every row coincides with a center".into(),
            ));
            return;
        }

        let mut target = total * ctrl.rng.gen::<f64>();
        let mut pick = None;
        'scan: for w in 0..self.workers {
            let start = partition_range(self.nrows, self.workers, w).start;
            let states = self.states[w].lock().unwrap();
            for (i, st) in states.iter().enumerate() {
                target -= st.kmspp_dist;
                if target <= 0.0 {
                    pick = Some(start + i);
                    break 'scan;
                }
            }
        }
        // Floating-point residue can survive the scan; take the last row.
        let next = pick.unwrap_or(self.nrows - 1);
        debug!("k-means++: row {} becomes center {}", next, ctrl.kmspp_idx + 1);
        ctrl.kmspp_next = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn forgy_draws_exactly_k_distinct_ids() {
        let mut rng = StdRng::seed_from_u64(1);
        // More clusters than half the rows forces duplicate draws.
        let picked = forgy_ids(&mut rng, 8, 10);
        assert_eq!(picked.len(), 8);
        let mut clusters: Vec<usize> = picked.values().copied().collect();
        clusters.sort_unstable();
        assert_eq!(clusters, (0..8).collect::<Vec<_>>());
        assert!(picked.keys().all(|&id| id < 10));
    }

    #[test]
    fn forgy_covers_every_cluster_when_k_equals_n() {
        let mut rng = StdRng::seed_from_u64(9);
        let picked = forgy_ids(&mut rng, 5, 5);
        let mut ids: Vec<usize> = picked.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
