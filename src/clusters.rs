use ndarray::{Array2, ArrayView1};

use crate::distance::euclidean;

/// Centroid bookkeeping for one clustering run.
///
/// Holds the current K x D mean matrix together with a shadow copy of the
/// previous means, per-cluster member counts, per-cluster drift (distance a
/// centroid moved in the last update) and the s-value used by the pruning
/// tests. The same type doubles as a per-worker accumulator: partition
/// programs accumulate partial sums or signed deltas into a private
/// `Clusters` and the reduction merges them into the global one.
///
/// Member counts are signed because a partition-local accumulator may hold
/// more removals than additions for a cluster within one iteration.
pub struct Clusters {
    means: Array2<f64>,
    prev_means: Array2<f64>,
    num_members: Vec<i64>,
    complete: Vec<bool>,
    prev_dist: Vec<f64>,
    s_val: Vec<f64>,
}

impl Clusters {
    pub fn new(nclust: usize, ncols: usize) -> Self {
        Clusters {
            means: Array2::zeros((nclust, ncols)),
            prev_means: Array2::zeros((nclust, ncols)),
            num_members: vec![0; nclust],
            complete: vec![false; nclust],
            prev_dist: vec![0.0; nclust],
            s_val: vec![0.0; nclust],
        }
    }

    pub fn means(&self) -> &Array2<f64> {
        &self.means
    }

    pub fn mean(&self, c: usize) -> &[f64] {
        self.means.row(c).to_slice().unwrap()
    }

    pub fn prev_mean(&self, c: usize) -> &[f64] {
        self.prev_means.row(c).to_slice().unwrap()
    }

    /// Overwrite cluster `c`'s mean directly (Forgy / k-means++ / caller
    /// supplied centers).
    pub fn set_mean(&mut self, c: usize, row: &[f64]) {
        self.means.row_mut(c).assign(&ArrayView1::from(row));
        self.complete[c] = true;
    }

    /// Accumulate one row into cluster `c`.
    pub fn add_row(&mut self, c: usize, row: &[f64]) {
        self.means.row_mut(c).scaled_add(1.0, &ArrayView1::from(row));
        self.num_members[c] += 1;
    }

    pub fn remove_row(&mut self, c: usize, row: &[f64]) {
        self.means.row_mut(c).scaled_add(-1.0, &ArrayView1::from(row));
        self.num_members[c] -= 1;
    }

    /// Move one row's membership from cluster `from` to cluster `to`.
    pub fn swap_membership(&mut self, row: &[f64], from: usize, to: usize) {
        self.remove_row(from, row);
        self.add_row(to, row);
    }

    /// Add another accumulator's partial sums and counts into this one.
    pub fn merge(&mut self, other: &Clusters) {
        self.means += &other.means;
        for (n, o) in self.num_members.iter_mut().zip(&other.num_members) {
            *n += o;
        }
    }

    /// Turn cluster `c`'s accumulated sum into a mean. Idempotent within an
    /// iteration. An empty cluster keeps the previous mean.
    pub fn finalize(&mut self, c: usize) {
        if self.complete[c] {
            return;
        }
        self.complete[c] = true;
        let n = self.num_members[c];
        if n > 0 {
            self.means.row_mut(c).mapv_inplace(|x| x / n as f64);
        } else {
            let prev = self.prev_means.row(c).to_owned();
            self.means.row_mut(c).assign(&prev);
        }
    }

    /// Convert a finalized mean back into an accumulator by multiplying the
    /// member count back in.
    pub fn unfinalize(&mut self, c: usize) {
        if !self.complete[c] {
            return;
        }
        self.complete[c] = false;
        let n = self.num_members[c];
        self.means.row_mut(c).mapv_inplace(|x| x * n as f64);
    }

    /// Zero all accumulators and counts. The previous-means shadow is
    /// preserved.
    pub fn clear(&mut self) {
        self.means.fill(0.0);
        self.num_members.iter_mut().for_each(|n| *n = 0);
        self.complete.iter_mut().for_each(|f| *f = false);
    }

    /// Copy the current means into the shadow.
    pub fn set_prev_means(&mut self) {
        self.prev_means.assign(&self.means);
    }

    /// Recompute cluster `c`'s drift from the shadow.
    pub fn update_prev_dist(&mut self, c: usize) {
        self.prev_dist[c] = euclidean(self.mean(c), self.prev_mean(c));
    }

    pub fn prev_dist(&self, c: usize) -> f64 {
        self.prev_dist[c]
    }

    pub fn prev_dists(&self) -> &[f64] {
        &self.prev_dist
    }

    pub fn set_s_val(&mut self, c: usize, v: f64) {
        self.s_val[c] = v;
    }

    pub fn s_val(&self, c: usize) -> f64 {
        self.s_val[c]
    }

    pub fn num_members(&self, c: usize) -> i64 {
        self.num_members[c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_mean_is_average_of_members() {
        let mut cl = Clusters::new(2, 2);
        cl.add_row(0, &[1.0, 2.0]);
        cl.add_row(0, &[3.0, 4.0]);
        cl.add_row(1, &[10.0, 0.0]);
        cl.finalize(0);
        cl.finalize(1);
        assert_eq!(cl.mean(0), &[2.0, 3.0]);
        assert_eq!(cl.mean(1), &[10.0, 0.0]);
        assert_eq!(cl.num_members(0), 2);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut cl = Clusters::new(1, 1);
        cl.add_row(0, &[4.0]);
        cl.add_row(0, &[8.0]);
        cl.finalize(0);
        cl.finalize(0);
        assert_eq!(cl.mean(0), &[6.0]);
    }

    #[test]
    fn empty_cluster_keeps_previous_mean() {
        let mut cl = Clusters::new(1, 2);
        cl.add_row(0, &[5.0, 7.0]);
        cl.finalize(0);
        cl.set_prev_means();
        cl.unfinalize(0);
        cl.clear();
        cl.finalize(0);
        assert_eq!(cl.mean(0), &[5.0, 7.0]);
        assert_eq!(cl.num_members(0), 0);
    }

    #[test]
    fn swap_deltas_merge_onto_running_accumulator() {
        // Global state after one iteration: rows a, b in cluster 0, row c in
        // cluster 1. Next iteration, b moves to cluster 1 via a partition
        // delta.
        let (a, b, c) = ([0.0, 0.0], [2.0, 2.0], [10.0, 10.0]);
        let mut global = Clusters::new(2, 2);
        global.add_row(0, &a);
        global.add_row(0, &b);
        global.add_row(1, &c);
        global.finalize(0);
        global.finalize(1);

        let mut delta = Clusters::new(2, 2);
        delta.swap_membership(&b, 0, 1);
        assert_eq!(delta.num_members(0), -1);

        global.set_prev_means();
        global.unfinalize(0);
        global.unfinalize(1);
        global.merge(&delta);
        global.finalize(0);
        global.finalize(1);

        assert_eq!(global.mean(0), &a);
        assert_eq!(global.mean(1), &[6.0, 6.0]);
        assert_eq!(global.num_members(0), 1);
        assert_eq!(global.num_members(1), 2);
    }

    #[test]
    fn drift_tracks_centroid_motion() {
        let mut cl = Clusters::new(1, 2);
        cl.set_mean(0, &[0.0, 0.0]);
        cl.set_prev_means();
        cl.set_mean(0, &[3.0, 4.0]);
        cl.update_prev_dist(0);
        assert!((cl.prev_dist(0) - 5.0).abs() < 1e-12);
    }
}
