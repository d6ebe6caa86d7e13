//! Binary entry point: parse a fixed argument list, run one NMFk sweep and
//! persist the coordinator's consolidated results.
//!
//! ```bash
//! $ cargo run --release -- data/matrix.npy 2 6 10
//! $ cargo run --release -- synthetic 2 6 10 2 2 results/
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use log::LevelFilter;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simple_logger::SimpleLogger;

use dist_nmfk::config::NmfkConfig;
use dist_nmfk::error::NmfkError;
use dist_nmfk::grid::{GridShape, ProcessGrid};
use dist_nmfk::io;
use dist_nmfk::runner::{select_rank, NmfkRunner, RankSummary};
use dist_nmfk::shard::{dense_block, DenseShard};

/// Dimensions of the synthetic problem used when no input file is given; the
/// planted rank sits in the middle of the requested range.
const SYNTHETIC_DIMS: (usize, usize) = (240, 180);

struct Args {
    input: Option<PathBuf>,
    config: NmfkConfig,
    out_dir: PathBuf,
}

/// Positional arguments: `<matrix.npy|synthetic> <k_min> <k_max> <runs>
/// [grid_rows] [grid_cols] [out_dir]`.
fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, NmfkError> {
    args.next(); // program name
    let missing = |name: &str| NmfkError::InvalidConfig(format!("missing argument: {name}"));
    let numeric = |name: &str, value: String| {
        value
            .parse::<usize>()
            .map_err(|_| NmfkError::InvalidConfig(format!("{name} must be a number, got '{value}'")))
    };

    let source = args.next().ok_or_else(|| missing("matrix path"))?;
    let k_min = numeric("k_min", args.next().ok_or_else(|| missing("k_min"))?)?;
    let k_max = numeric("k_max", args.next().ok_or_else(|| missing("k_max"))?)?;
    let runs = numeric("runs", args.next().ok_or_else(|| missing("runs"))?)?;
    let grid_rows = match args.next() {
        Some(v) => numeric("grid_rows", v)?,
        None => 1,
    };
    let grid_cols = match args.next() {
        Some(v) => numeric("grid_cols", v)?,
        None => 1,
    };
    let out_dir = PathBuf::from(args.next().unwrap_or_else(|| "results".into()));

    let config = NmfkConfig {
        k_min,
        k_max,
        runs,
        grid_rows,
        grid_cols,
        ..NmfkConfig::default()
    };
    config.validate()?;

    let input = if source == "synthetic" {
        None
    } else {
        Some(PathBuf::from(source))
    };
    Ok(Args {
        input,
        config,
        out_dir,
    })
}

fn load_input(args: &Args) -> Result<Array2<f64>, NmfkError> {
    match &args.input {
        Some(path) => io::load_dense_npy(path),
        None => {
            let (m, n) = SYNTHETIC_DIMS;
            let planted = (args.config.k_min + args.config.k_max) / 2;
            let mut rng = StdRng::seed_from_u64(args.config.seed);
            log::info!("generating {m}x{n} synthetic matrix with planted rank {planted}");
            Ok(io::planted_low_rank(m, n, planted, 0.05, &mut rng))
        }
    }
}

fn run_sweep(args: &Args, matrix: &Array2<f64>) -> Result<Vec<RankSummary>, NmfkError> {
    let cfg = &args.config;
    let shape = GridShape::new(cfg.grid_rows, cfg.grid_cols);
    let grid = ProcessGrid::new(shape, cfg.world_size())?;
    let out_dir: &Path = &args.out_dir;

    let mut results = grid.run(|comm| {
        let shard = DenseShard::new(dense_block(&matrix.view(), shape, comm.rank()));
        let runner = NmfkRunner::new(&comm, &shard, cfg)?;
        let mut summaries = Vec::new();
        for k in cfg.k_min..=cfg.k_max {
            let outcome = runner.evaluate_rank(k)?;
            let median_w = runner.gather_median_w(&outcome)?;
            let median_h = runner.gather_median_h(&outcome)?;
            // the gathers return Some exactly at the coordinator
            if let (Some(w), Some(h)) = (median_w, median_h) {
                io::write_dense_npy(&out_dir.join(format!("median_w_k{k}.npy")), &w)?;
                io::write_dense_npy(&out_dir.join(format!("median_h_k{k}.npy")), &h)?;
                io::write_dense_npy(
                    &out_dir.join(format!("silhouette_k{k}.npy")),
                    &outcome.silhouettes,
                )?;
            }
            summaries.push(outcome.summary());
        }
        Ok(summaries)
    })?;
    // summaries are derived from grid-reduced values; rank 0's copy suffices
    Ok(results.swap_remove(0))
}

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .expect("logger init");

    let args = match parse_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            log::error!("{e}");
            eprintln!(
                "usage: dist_nmfk <matrix.npy|synthetic> <k_min> <k_max> <runs> \
                 [grid_rows] [grid_cols] [out_dir]"
            );
            std::process::exit(2);
        }
    };

    let cfg = &args.config;
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.threads)
        .build_global()
    {
        log::debug!("rayon pool already initialized: {e}");
    }
    log::info!(
        "dist_nmfk sweep started {} | k in [{}, {}], {} runs, {}x{} grid, rule {:?}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        cfg.k_min,
        cfg.k_max,
        cfg.runs,
        cfg.grid_rows,
        cfg.grid_cols,
        cfg.rule,
    );

    let started = Instant::now();
    let outcome = load_input(&args).and_then(|matrix| run_sweep(&args, &matrix));
    let summaries = match outcome {
        Ok(summaries) => summaries,
        Err(e) => {
            log::error!("sweep failed: {e}");
            std::process::exit(1);
        }
    };

    for s in &summaries {
        log::info!(
            "k={}: min width {:.4}, mean width {:.4}, mean relative error {:.4e}, {} converged",
            s.k,
            s.min_width,
            s.mean_width,
            s.mean_rel_error,
            s.converged_runs,
        );
    }
    match select_rank(&summaries) {
        Some(k) => log::info!("selected rank k={k} in {:.2?}", started.elapsed()),
        None => log::warn!("no candidate ranks evaluated"),
    }
}
