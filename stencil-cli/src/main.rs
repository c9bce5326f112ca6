mod ic;
mod timer;

use clap::{Parser, ValueEnum, value_parser};
use ic::{InitKind, generate_ic};
use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use stencil_core::schedule::DEFAULT_TILE;
use stencil_core::{
    Dispatch, Grid, Perturbation, Phase, Schedule, Simulation, SimulationConfig, StencilParams,
};
use timer::PhaseTimer;

/// Parallel 2D diffusion (viscosity) stencil: runs the update under one or
/// all work-distribution schedules and compares them
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Grid size N (NxN)
    #[arg(default_value_t = 1024, value_parser = value_parser!(u32).range(3..=2048))]
    grid_size: u32,

    /// Number of iterations
    #[arg(default_value_t = 3000, value_parser = value_parser!(u32).range(1..=10_000_000))]
    iterations: u32,

    /// Worker threads
    #[arg(default_value_t = 8, env = "STENCIL_THREADS", value_parser = value_parser!(u32).range(1..=256))]
    threads: u32,

    /// Schedule to run; "all" runs every one and compares them
    #[arg(long, value_enum, default_value_t = ScheduleKind::All)]
    schedule: ScheduleKind,

    /// Rows per chunk for the dynamic schedule
    #[arg(long, default_value_t = 4, value_parser = value_parser!(u32).range(1..))]
    chunk: u32,

    /// Smallest chunk for the guided schedule
    #[arg(long, default_value_t = 1, value_parser = value_parser!(u32).range(1..))]
    min_chunk: u32,

    /// Tile edge for the tiled schedule
    #[arg(long, default_value_t = DEFAULT_TILE as u32, value_parser = value_parser!(u32).range(1..))]
    tile: u32,

    /// How tiles are handed to workers
    #[arg(long, value_enum, default_value_t = TileDispatch::Static)]
    tile_dispatch: TileDispatch,

    /// Time step
    #[arg(long, default_value_t = 1e-5)]
    dt: f64,

    /// Viscosity (diffusion coefficient)
    #[arg(long, default_value_t = 0.1)]
    nu: f64,

    /// Initial condition
    #[arg(long, value_enum, default_value_t = InitKind::Gaussian)]
    init: InitKind,

    /// RNG seed for random initial conditions
    #[arg(long, default_value_t = 123)]
    seed: u64,

    /// Print diagnostics every K iterations
    #[arg(long, value_parser = value_parser!(u32).range(1..))]
    diag_every: Option<u32>,

    /// Also write diagnostics as JSON lines to this file
    #[arg(long)]
    diag_out: Option<PathBuf>,

    /// Time a 1-thread static run first; speedup and efficiency are
    /// reported against it
    #[arg(long)]
    baseline: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ScheduleKind {
    Static,
    Dynamic,
    Guided,
    Tiled,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TileDispatch {
    Static,
    Dynamic,
}

impl Args {
    fn schedules(&self) -> Vec<Schedule> {
        let dispatch = match self.tile_dispatch {
            TileDispatch::Static => Dispatch::Static,
            TileDispatch::Dynamic => Dispatch::Dynamic,
        };
        let stat = Schedule::Static;
        let dynamic = Schedule::Dynamic {
            chunk: self.chunk as usize,
        };
        let guided = Schedule::Guided {
            min_chunk: self.min_chunk as usize,
        };
        let tiled = Schedule::Tiled {
            tile: self.tile as usize,
            assignment: dispatch,
        };
        match self.schedule {
            ScheduleKind::Static => vec![stat],
            ScheduleKind::Dynamic => vec![dynamic],
            ScheduleKind::Guided => vec![guided],
            ScheduleKind::Tiled => vec![tiled],
            ScheduleKind::All => vec![stat, dynamic, guided, tiled],
        }
    }

    fn runs(&self) -> Vec<Run> {
        let threads = self.threads as usize;
        let serial = self.baseline.then_some(Run {
            schedule: Schedule::Static,
            threads: 1,
        });
        serial
            .into_iter()
            .chain(self.schedules().into_iter().map(|schedule| Run { schedule, threads }))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Run {
    schedule: Schedule,
    threads: usize,
}

#[derive(Serialize)]
struct DiagRow {
    schedule: String,
    threads: usize,
    iteration: usize,
    kinetic_energy: f64,
    max_divergence: f64,
}

struct RunResult {
    run: Run,
    elapsed: Duration,
    timer: PhaseTimer,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let n = args.grid_size as usize;
    let grid = Grid::square(n)?;
    let params = StencilParams::new(args.dt, args.nu)?;
    let base = SimulationConfig {
        iterations: args.iterations as usize,
        threads: args.threads as usize,
        params,
        perturbation: args.init.perturbation(grid).unwrap_or(Perturbation::Still),
        diagnostics_every: args.diag_every.map(|k| k as usize),
        ..SimulationConfig::square(n)
    };

    // Random initial conditions are drawn once and shared by every run.
    let loaded: Vec<(String, Vec<f64>)> = match args.init.perturbation(grid) {
        Some(_) => Vec::new(),
        None => base
            .fields
            .iter()
            .enumerate()
            .map(|(k, spec)| {
                let seed = args.seed ^ (k as u64).wrapping_mul(0x9E3779B97F4A7C15);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                (spec.name.clone(), generate_ic(&mut rng, grid, args.init, spec.amplitude))
            })
            .collect(),
    };

    println!("Parallel diffusion stencil");
    println!("Grid            = {n}x{n}");
    println!("Iterations      = {}", base.iterations);
    println!("Threads         = {}", base.threads);
    println!("dt, nu          = {}, {}", params.dt, params.diffusion);
    println!("Initial state   = {}", args.init.as_str());
    if args.baseline {
        println!("Baseline        = static, 1 thread");
    }
    println!();

    let mut diag_out = match &args.diag_out {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };

    let mut results: Vec<RunResult> = Vec::new();
    let mut reference: Option<Vec<Vec<f64>>> = None;
    let mut identical = true;

    for run in args.runs() {
        let Run { schedule, threads } = run;
        let config = SimulationConfig {
            schedule,
            threads,
            ..base.clone()
        };
        let mut sim = Simulation::new(config)?;
        let mut timer = PhaseTimer::default();
        sim.initialize(&mut timer)?;
        for (name, values) in &loaded {
            sim.load_field(name, values)?;
        }

        info!("running schedule {schedule} on {threads} thread(s)");
        let t0 = Instant::now();
        sim.run(&mut timer)?;
        let elapsed = t0.elapsed();

        for d in &timer.samples {
            println!(
                "[{schedule}, {threads}t] iteration {}: energy = {:.6}, max divergence = {:.6e}",
                d.iteration, d.kinetic_energy, d.max_divergence
            );
            if let Some(out) = diag_out.as_mut() {
                let row = DiagRow {
                    schedule: schedule.to_string(),
                    threads,
                    iteration: d.iteration,
                    kinetic_energy: d.kinetic_energy,
                    max_divergence: d.max_divergence,
                };
                serde_json::to_writer(&mut *out, &row)?;
                out.write_all(b"\n")?;
            }
        }

        let snapshot: Vec<Vec<f64>> = sim.fields().iter().map(|f| f.current().to_vec()).collect();
        if let Some(first) = &reference {
            let same = bits(first).eq(bits(&snapshot));
            debug!("{schedule}: identical to first run = {same}");
            identical &= same;
        }
        if reference.is_none() {
            reference = Some(snapshot);
        }

        results.push(RunResult {
            run,
            elapsed,
            timer,
        });
    }

    if let Some(mut out) = diag_out {
        out.flush()?;
    }

    print_table(&results, base.iterations, args.baseline);
    if results.len() > 1 {
        if identical {
            println!("Final fields are bit-identical across schedules");
        } else {
            println!("WARNING: final fields differ between schedules");
        }
    }

    Ok(())
}

fn bits(fields: &[Vec<f64>]) -> impl Iterator<Item = u64> + '_ {
    fields.iter().flatten().map(|x| x.to_bits())
}

/// Speedup of a `threads`-wide run over `baseline` seconds, and its
/// parallel efficiency in %
fn scaling(baseline: f64, secs: f64, threads: usize) -> (f64, f64) {
    let speedup = baseline / secs;
    (speedup, 100.0 * speedup / threads.max(1) as f64)
}

fn print_table(results: &[RunResult], iterations: usize, serial_baseline: bool) {
    let Some(first) = results.first() else {
        return;
    };
    let baseline = first.elapsed.as_secs_f64();

    println!();
    println!(
        "{:<28} {:>7} {:>10} {:>12} {:>9} {:>11} {:>10} {:>10}",
        "schedule", "threads", "time (s)", "iter/s", "speedup", "efficiency", "update", "boundary"
    );
    for r in results {
        let secs = r.elapsed.as_secs_f64();
        let (speedup, efficiency) = scaling(baseline, secs, r.run.threads);
        let efficiency = if serial_baseline {
            format!("{efficiency:.1}%")
        } else {
            "-".to_string()
        };
        println!(
            "{:<28} {:>7} {:>10.4} {:>12.1} {:>8.2}x {:>11} {:>10.4} {:>10.4}",
            r.run.schedule.to_string(),
            r.run.threads,
            secs,
            iterations as f64 / secs,
            speedup,
            efficiency,
            r.timer.spent(Phase::Update).as_secs_f64(),
            r.timer.spent(Phase::Boundary).as_secs_f64(),
        );
    }
}
