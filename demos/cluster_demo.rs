use diskmeans::{cluster, ClusterConfig, InitMethod, MmapRows};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn main() {
    println!("Starting diskmeans demo.");
    rayon::ThreadPoolBuilder::new()
        .num_threads(std::thread::available_parallelism().unwrap().get())
        .build_global()
        .unwrap();

    // Generate and save a test matrix if the file doesn't exist
    let row_file = "demo_rows.bin";
    let (nrows, ncols, k) = (100_000, 16, 32);
    if !std::path::Path::new(row_file).exists() {
        println!("Generating {} x {} test matrix...", nrows, ncols);
        let mut rng = StdRng::seed_from_u64(7);
        let mut data = Array2::<f64>::zeros((nrows, ncols));
        for mut row in data.rows_mut() {
            let blob = rng.gen_range(0..k) as f64;
            for x in row.iter_mut() {
                *x = blob * 25.0 + rng.gen_range(-1.0..1.0);
            }
        }
        MmapRows::create(row_file, &data).expect("Failed to write row file");
        println!("Test matrix saved to {}", row_file);
    }

    println!("Mapping rows from file...");
    let source = MmapRows::open(row_file).expect("Failed to open row file");

    let cfg = ClusterConfig::new(k)
        .with_init(InitMethod::PlusPlus)
        .with_max_iters(50)
        .with_tolerance(0.001)
        .with_cache_bytes(8 * 1024 * 1024)
        .with_full_bounds(false);

    println!("Clustering into {} groups...", k);
    match cluster(&source, &cfg) {
        Ok(out) => {
            println!("\n=== Clustering finished ===");
            println!("Converged: {} after {} iterations", out.converged, out.iters);
            println!(
                "Steady-state row fetches: {}, cache hits: {}, cache regens: {}",
                out.stats.io_requests, out.stats.cache_hits, out.stats.cache_regens
            );
            let largest = out.sizes.iter().max().unwrap();
            let smallest = out.sizes.iter().min().unwrap();
            println!("Cluster sizes: min {}, max {}", smallest, largest);
        }
        Err(e) => {
            eprintln!("Clustering failed: {}", e);
        }
    }
}
