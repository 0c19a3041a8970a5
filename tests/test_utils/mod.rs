use diskmeans::MemRows;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Create synthetic data with well-separated Gaussian clusters.
/// Returns (data, true_labels).
#[allow(dead_code)]
pub fn create_gaussian_clusters(
    num_clusters: usize,
    points_per_cluster: usize,
    dim: usize,
    separation: f64,
    seed: u64,
) -> (Array2<f64>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);

    let total_points = num_clusters * points_per_cluster;
    let mut data = Array2::<f64>::zeros((total_points, dim));
    let mut true_labels = Vec::with_capacity(total_points);

    for cluster_id in 0..num_clusters {
        // Center for this cluster
        let center: Vec<f64> = (0..dim)
            .map(|d| (cluster_id as f64) * separation + (d as f64) * 0.1)
            .collect();

        // Points around the center
        for point_id in 0..points_per_cluster {
            let idx = cluster_id * points_per_cluster + point_id;
            true_labels.push(cluster_id);

            for d in 0..dim {
                let noise: f64 = rng.gen_range(-0.5..0.5);
                data[(idx, d)] = center[d] + noise;
            }
        }
    }

    (data, true_labels)
}

/// Wrap a matrix as an in-memory row source.
#[allow(dead_code)]
pub fn mem_source(data: &Array2<f64>) -> MemRows {
    MemRows::new(data.clone())
}

#[allow(dead_code)]
pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Within-cluster sum of squares (inertia).
#[allow(dead_code)]
pub fn calculate_inertia(data: &Array2<f64>, centroids: &Array2<f64>, labels: &[usize]) -> f64 {
    let mut inertia = 0.0;
    for (i, &label) in labels.iter().enumerate() {
        let point = data.row(i);
        let centroid = centroids.row(label);
        inertia +=
            euclidean_distance(point.to_slice().unwrap(), centroid.to_slice().unwrap()).powi(2);
    }
    inertia
}

/// Verify that each point is assigned to its nearest centroid.
#[allow(dead_code)]
pub fn verify_optimal_assignment(
    data: &Array2<f64>,
    centroids: &Array2<f64>,
    labels: &[usize],
) -> bool {
    for (i, &assigned_label) in labels.iter().enumerate() {
        let point = data.row(i);
        let point = point.to_slice().unwrap();
        let assigned_dist =
            euclidean_distance(point, centroids.row(assigned_label).to_slice().unwrap());

        // Check whether any other centroid is closer
        for c in 0..centroids.nrows() {
            let dist = euclidean_distance(point, centroids.row(c).to_slice().unwrap());
            if dist < assigned_dist - 1e-9 {
                return false;
            }
        }
    }
    true
}

/// Mean of the rows assigned to each cluster, computed independently of the
/// engine.
#[allow(dead_code)]
pub fn recompute_means(data: &Array2<f64>, labels: &[usize], k: usize) -> Array2<f64> {
    let dim = data.ncols();
    let mut means = Array2::<f64>::zeros((k, dim));
    let mut counts = vec![0usize; k];
    for (i, &label) in labels.iter().enumerate() {
        for d in 0..dim {
            means[(label, d)] += data[(i, d)];
        }
        counts[label] += 1;
    }
    for c in 0..k {
        if counts[c] > 0 {
            for d in 0..dim {
                means[(c, d)] /= counts[c] as f64;
            }
        }
    }
    means
}
