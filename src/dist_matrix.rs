use crate::clusters::Clusters;
use crate::distance::euclidean;

/// Symmetric inter-centroid distance table.
///
/// Only the upper triangle is stored, and every entry is kept pre-halved
/// because `D(i, j) / 2` is the only form the pruning tests consult.
/// Rebuilt in full after every centroid update and after each k-means++
/// center selection; the rebuild also refreshes the per-cluster s-values
/// (half the distance to the nearest other centroid).
pub struct DistMatrix {
    nclust: usize,
    half: Vec<f64>,
}

impl DistMatrix {
    pub fn new(nclust: usize) -> Self {
        assert!(nclust >= 2, "distance matrix needs at least two clusters");
        DistMatrix {
            nclust,
            half: vec![0.0; nclust * (nclust - 1) / 2],
        }
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < j && j < self.nclust);
        i * self.nclust - i * (i + 1) / 2 + (j - i - 1)
    }

    /// Half the distance between centroids `i` and `j`; zero on the
    /// diagonal.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        match i.cmp(&j) {
            std::cmp::Ordering::Less => self.half[self.index(i, j)],
            std::cmp::Ordering::Greater => self.half[self.index(j, i)],
            std::cmp::Ordering::Equal => 0.0,
        }
    }

    /// `s[i]`: half the distance from centroid `i` to its nearest other
    /// centroid.
    pub fn min_half_dist(&self, i: usize) -> f64 {
        (0..self.nclust)
            .filter(|&j| j != i)
            .map(|j| self.get(i, j))
            .fold(f64::INFINITY, f64::min)
    }

    /// Rebuild the table from the current means and push fresh s-values
    /// into `clusters`.
    pub fn compute(&mut self, clusters: &mut Clusters) {
        let k = self.nclust;
        for i in 0..k {
            for j in (i + 1)..k {
                let d = euclidean(clusters.mean(i), clusters.mean(j));
                let idx = self.index(i, j);
                self.half[idx] = d / 2.0;
            }
        }
        for i in 0..k {
            let s = self.min_half_dist(i);
            clusters.set_s_val(i, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_centroids() -> (Clusters, DistMatrix) {
        let mut cl = Clusters::new(3, 2);
        cl.set_mean(0, &[0.0, 0.0]);
        cl.set_mean(1, &[6.0, 8.0]);
        cl.set_mean(2, &[0.0, 2.0]);
        let mut dm = DistMatrix::new(3);
        dm.compute(&mut cl);
        (cl, dm)
    }

    #[test]
    fn entries_are_half_distances() {
        let (_, dm) = three_centroids();
        assert!((dm.get(0, 1) - 5.0).abs() < 1e-12);
        assert!((dm.get(0, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn symmetric_with_zero_diagonal() {
        let (_, dm) = three_centroids();
        for i in 0..3 {
            assert_eq!(dm.get(i, i), 0.0);
            for j in 0..3 {
                assert_eq!(dm.get(i, j), dm.get(j, i));
                assert!(dm.get(i, j) >= 0.0);
            }
        }
    }

    #[test]
    fn s_value_is_nearest_neighbor_half_distance() {
        let (cl, dm) = three_centroids();
        assert!((dm.min_half_dist(0) - 1.0).abs() < 1e-12);
        assert!((cl.s_val(1) - dm.min_half_dist(1)).abs() < 1e-12);
        // Centroid 1 is nearest to centroid 2: dist((6,8),(0,2)) / 2.
        let expect = (36.0f64 + 36.0).sqrt() / 2.0;
        assert!((cl.s_val(1) - expect).abs() < 1e-12);
    }
}
