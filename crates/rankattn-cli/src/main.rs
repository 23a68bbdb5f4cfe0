use std::path::Path;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use rankattn_core::{RankAttnError, Result, Shape, Tensor};
use rankattn_kernels::{
    rank_attention_backward, rank_attention_forward, validate_shapes, RankAttentionConfig,
    RankAttentionOutput, DEFAULT_MAX_RANK,
};

#[derive(Parser)]
#[command(
    name = "rankattn",
    about = "RankAttention CPU kernel driver",
    long_about = "Runs the rank attention forward/backward kernels on synthetic problems:\ntiming, finite-difference gradient checks, and config-driven runs.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show thread pool size and kernel defaults
    Info,
    /// Time forward and backward over several batch sizes
    Bench {
        /// Instance counts to benchmark (comma-separated)
        #[arg(long, default_value = "64,256,1024,4096")]
        sizes: String,
        /// Feature width of X
        #[arg(long, default_value = "16")]
        fea: usize,
        /// Columns of RankParam
        #[arg(long, default_value = "32")]
        cols: usize,
        /// Rank slots per instance
        #[arg(long, default_value_t = DEFAULT_MAX_RANK)]
        max_rank: usize,
        /// Iterations per size
        #[arg(long, default_value = "20")]
        iters: usize,
    },
    /// Compare analytic and finite-difference gradients on a random problem
    Gradcheck {
        #[arg(long, default_value = "0")]
        seed: u64,
        /// Maximum tolerated relative error
        #[arg(long, default_value = "1e-6")]
        tol: f64,
    },
    /// Run a random problem described by a JSON config and print checksums
    Run {
        /// Path to the problem config (defaults are used when omitted)
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Bench { sizes, fea, cols, max_rank, iters } => {
            cmd_bench(&sizes, fea, cols, max_rank, iters)
        }
        Commands::Gradcheck { seed, tol } => cmd_gradcheck(seed, tol),
        Commands::Run { config } => cmd_run(config.as_deref()),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn cmd_info() {
    let defaults = RankAttentionConfig::default();
    println!("rankattn v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:      {}", std::env::consts::OS);
    println!("  Arch:    {}", std::env::consts::ARCH);
    println!("  Threads: {}", rayon::current_num_threads());

    println!("\nKernel defaults");
    println!("  MaxRank:       {}", defaults.max_rank);
    println!("  par threshold: {}", defaults.par_threshold);

    println!("\nDTypes");
    println!("  X / RankParam / Out@GRAD: f32, f64");
    println!("  RankOffset:               i32");
}

/// Synthetic problem description for `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ProblemConfig {
    ins_num: usize,
    x_fea_dim: usize,
    para_col: usize,
    /// Number of `x_fea_dim`-row blocks stacked in RankParam.
    num_blocks: usize,
    seed: u64,
    /// Chance that a slot is left empty.
    sentinel_prob: f64,
    #[serde(flatten)]
    kernel: RankAttentionConfig,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            ins_num: 128,
            x_fea_dim: 8,
            para_col: 16,
            num_blocks: 4,
            seed: 0,
            sentinel_prob: 0.2,
            kernel: RankAttentionConfig::default(),
        }
    }
}

impl ProblemConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RankAttnError::InvalidArgument(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
            .map_err(|e| RankAttnError::InvalidArgument(format!("{}: {e}", path.display())))
    }

    fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| RankAttnError::InvalidArgument(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.kernel.validate()?;
        if self.num_blocks == 0 {
            return Err(RankAttnError::InvalidArgument("num_blocks must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.sentinel_prob) {
            return Err(RankAttnError::InvalidArgument(format!(
                "sentinel_prob must be in [0, 1], got {}",
                self.sentinel_prob
            )));
        }
        Ok(())
    }
}

struct Problem {
    x: Tensor,
    rank_offset: Tensor,
    rank_param: Tensor,
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| RankAttnError::InvalidArgument(format!("{what} {value} does not fit in i32")))
}

fn overflow(what: &str) -> RankAttnError {
    RankAttnError::InvalidArgument(format!("{what} overflows usize"))
}

/// `[own_rank, (rank, row_offset) * max_rank]` rows pointing at whole blocks.
fn random_offsets(rng: &mut StdRng, cfg: &ProblemConfig, len: usize) -> Result<Vec<i32>> {
    let mut offsets = Vec::with_capacity(len);
    for _ in 0..cfg.ins_num {
        offsets.push(to_i32(rng.gen_range(0..cfg.num_blocks), "own rank")?);
        for _ in 0..cfg.kernel.max_rank {
            if rng.gen_bool(cfg.sentinel_prob) {
                offsets.extend_from_slice(&[-1, 0]);
            } else {
                let block = rng.gen_range(0..cfg.num_blocks);
                offsets.push(to_i32(block, "rank id")?);
                let row = block
                    .checked_mul(cfg.x_fea_dim)
                    .ok_or_else(|| overflow("RankParam row offset"))?;
                offsets.push(to_i32(row, "RankParam row offset")?);
            }
        }
    }
    Ok(offsets)
}

/// Random f64 values are generated once and narrowed when `f32` is requested.
fn random_problem(cfg: &ProblemConfig, f64_data: bool) -> Result<Problem> {
    let max_rank = cfg.kernel.max_rank;
    let offset_cols = max_rank
        .checked_mul(2)
        .and_then(|c| c.checked_add(1))
        .ok_or_else(|| overflow("RankOffset columns"))?;
    let param_rows = cfg
        .num_blocks
        .checked_mul(cfg.x_fea_dim)
        .ok_or_else(|| overflow("RankParam rows"))?;
    let x_len = cfg
        .ins_num
        .checked_mul(cfg.x_fea_dim)
        .ok_or_else(|| overflow("X size"))?;
    let param_len = param_rows
        .checked_mul(cfg.para_col)
        .ok_or_else(|| overflow("RankParam size"))?;
    let offset_len = cfg
        .ins_num
        .checked_mul(offset_cols)
        .ok_or_else(|| overflow("RankOffset size"))?;
    let x_shape = [cfg.ins_num, cfg.x_fea_dim];
    let p_shape = [param_rows, cfg.para_col];
    // reject sizes the kernel cannot expand before allocating anything
    validate_shapes(
        &Shape::new(&x_shape),
        &Shape::new(&[cfg.ins_num, offset_cols]),
        &Shape::new(&p_shape),
        max_rank,
    )?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let x: Vec<f64> = (0..x_len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let param: Vec<f64> = (0..param_len).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let offsets = random_offsets(&mut rng, cfg, offset_len)?;

    let (x, rank_param) = if f64_data {
        (Tensor::from_f64(&x, &x_shape), Tensor::from_f64(&param, &p_shape))
    } else {
        let narrow = |v: &[f64]| v.iter().map(|&e| e as f32).collect::<Vec<_>>();
        (
            Tensor::from_f32(&narrow(&x), &x_shape),
            Tensor::from_f32(&narrow(&param), &p_shape),
        )
    };
    Ok(Problem {
        x,
        rank_offset: Tensor::from_i32(&offsets, &[cfg.ins_num, offset_cols]),
        rank_param,
    })
}

fn forward(p: &Problem, cfg: &RankAttentionConfig) -> Result<RankAttentionOutput> {
    rank_attention_forward(&p.x, &p.rank_offset, &p.rank_param, cfg)
}

fn backward(
    p: &Problem,
    fwd: &RankAttentionOutput,
    grad_out: &Tensor,
    cfg: &RankAttentionConfig,
) -> Result<Tensor> {
    rank_attention_backward(
        &p.x,
        &p.rank_offset,
        &p.rank_param,
        &fwd.input_help,
        &fwd.param_help,
        &fwd.ins_rank,
        grad_out,
        cfg,
    )
}

fn checksum(t: &Tensor) -> f64 {
    t.to_f64_vec().map(|v| v.iter().sum()).unwrap_or(f64::NAN)
}

fn cmd_bench(sizes_str: &str, fea: usize, cols: usize, max_rank: usize, iters: usize) -> Result<()> {
    let sizes = parse_sizes(sizes_str)?;
    let kernel = RankAttentionConfig::new(max_rank)?;
    let iters = iters.max(1);

    println!("=== RankAttention Benchmark ===");
    println!(
        "x_fea_dim={fea} para_col={cols} MaxRank={max_rank} threads={}\n",
        rayon::current_num_threads()
    );
    println!("{:<10} {:>14} {:>14} {:>12}", "Instances", "Forward (ms)", "Backward (ms)", "GFLOP/s");
    println!("{}", "-".repeat(53));

    for &ins_num in &sizes {
        let cfg = ProblemConfig {
            ins_num,
            x_fea_dim: fea,
            para_col: cols,
            num_blocks: 8,
            kernel,
            ..ProblemConfig::default()
        };
        let p = random_problem(&cfg, false)?;
        let grad_out = Tensor::from_f32(&vec![1.0; ins_num * cols], &[ins_num, cols]);

        // warmup
        let fwd = forward(&p, &kernel)?;
        backward(&p, &fwd, &grad_out, &kernel)?;

        let fwd_s = time_it(iters, || forward(&p, &kernel).map(|_| ()))?;
        let bwd_s = time_it(iters, || backward(&p, &fwd, &grad_out, &kernel).map(|_| ()))?;

        let flops = 2.0 * ins_num as f64 * (max_rank * fea) as f64 * cols as f64;
        println!(
            "{:<10} {:>12.3}ms {:>12.3}ms {:>12.2}",
            ins_num,
            fwd_s * 1000.0,
            bwd_s * 1000.0,
            flops / fwd_s / 1e9,
        );
    }
    Ok(())
}

fn parse_sizes(sizes_str: &str) -> Result<Vec<usize>> {
    sizes_str
        .split(',')
        .map(|s| {
            let s = s.trim();
            s.parse().map_err(|e| {
                RankAttnError::InvalidArgument(format!("--sizes: bad entry {s:?}: {e}"))
            })
        })
        .collect()
}

fn time_it(iters: usize, mut f: impl FnMut() -> Result<()>) -> Result<f64> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}

fn cmd_gradcheck(seed: u64, tol: f64) -> Result<()> {
    let cfg = ProblemConfig {
        ins_num: 6,
        x_fea_dim: 3,
        para_col: 4,
        num_blocks: 3,
        seed,
        sentinel_prob: 0.25,
        kernel: RankAttentionConfig::new(2)?,
    };
    let mut p = random_problem(&cfg, true)?;
    let kernel = cfg.kernel;

    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let weights: Vec<f64> = (0..cfg.ins_num * cfg.para_col)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let grad_out = Tensor::from_f64(&weights, &[cfg.ins_num, cfg.para_col]);

    let fwd = forward(&p, &kernel)?;
    let analytic = backward(&p, &fwd, &grad_out, &kernel)?
        .to_f64_vec()
        .ok_or_else(|| RankAttnError::StorageError("gradient is not a float tensor".into()))?;

    let param = p
        .rank_param
        .to_f64_vec()
        .ok_or_else(|| RankAttnError::StorageError("RankParam is not a float tensor".into()))?;
    let shape = p.rank_param.shape().dims().to_vec();
    let eps = 1e-5;
    let mut max_rel = 0.0f64;
    for i in 0..param.len() {
        let mut loss_at = |delta: f64| -> Result<f64> {
            let mut buf = param.clone();
            buf[i] += delta;
            p.rank_param = Tensor::from_f64(&buf, &shape);
            let out = forward(&p, &kernel)?.out;
            Ok(out
                .to_f64_vec()
                .unwrap_or_default()
                .iter()
                .zip(&weights)
                .map(|(o, w)| o * w)
                .sum())
        };
        let numerical = (loss_at(eps)? - loss_at(-eps)?) / (2.0 * eps);
        let abs_err = (analytic[i] - numerical).abs();
        if abs_err > 1e-8 {
            let scale = analytic[i].abs().max(numerical.abs()).max(1e-12);
            max_rel = max_rel.max(abs_err / scale);
        }
    }

    println!("seed={seed} params={} max_rel_err={max_rel:.3e} tol={tol:.1e}", param.len());
    if max_rel > tol {
        return Err(RankAttnError::InvalidArgument(format!(
            "gradient check failed: relative error {max_rel:.3e} exceeds {tol:.1e}"
        )));
    }
    println!("gradient check passed");
    Ok(())
}

fn cmd_run(config_path: Option<&str>) -> Result<()> {
    let cfg = match config_path {
        Some(path) => ProblemConfig::load(Path::new(path))?,
        None => ProblemConfig::default(),
    };
    tracing::info!(?cfg, "running rank attention problem");

    let p = random_problem(&cfg, false)?;
    let fwd = forward(&p, &cfg.kernel)?;
    let grad_out = Tensor::from_f32(&vec![1.0; cfg.ins_num * cfg.para_col], &[cfg.ins_num, cfg.para_col]);
    let grad = backward(&p, &fwd, &grad_out, &cfg.kernel)?;

    for (name, t) in [
        ("Out", &fwd.out),
        ("InputHelp", &fwd.input_help),
        ("ParamHelp", &fwd.param_help),
        ("InsRank", &fwd.ins_rank),
        ("RankParam@GRAD", &grad),
    ] {
        println!("{:<16} {:<14} sum={:.6}", name, t.shape().to_string(), checksum(t));
    }
    Ok(())
}
