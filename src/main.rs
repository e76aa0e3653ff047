use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use mesi_smp_sim::smp::asm::parse_asm;
use mesi_smp_sim::smp::system::{DOTPROD_ASM, System, SystemConfig};
use mesi_smp_sim::stepper::Stepper;

#[derive(Parser)]
#[command(
    name = "mesi-smp-sim",
    about = "Shared-memory multiprocessor simulator with MESI-coherent L1 caches"
)]
struct Args {
    /// Number of processing elements
    #[arg(long, default_value_t = 4)]
    pes: usize,

    /// Vector length of the dot-product workload
    #[arg(long, default_value_t = 8)]
    n: usize,

    /// Assembly program to load (defaults to the built-in dot product)
    #[arg(long)]
    program: Option<PathBuf>,

    /// Run to completion and print results instead of starting the stepper
    #[arg(long)]
    batch: bool,
}

fn main() -> ExitCode {
    fmt::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    if args.pes == 0 || args.n == 0 {
        eprintln!("error: --pes and --n must be positive");
        return ExitCode::FAILURE;
    }

    let source = match &args.program {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("error: could not read {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => DOTPROD_ASM.to_string(),
    };
    let program = parse_asm(&source);

    let config = SystemConfig {
        num_pes: args.pes,
        n: args.n,
        ..SystemConfig::default()
    };
    tracing::info!(pes = config.num_pes, n = config.n, "initializing system");
    let system = match System::new(config) {
        Ok(system) => system,
        Err(e) => {
            eprintln!("error: system initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    system.load_program(&program);

    if args.batch {
        return run_batch(&system);
    }

    let mut stepper = Stepper::new(system);
    match stepper.repl() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: stepper I/O failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Non-interactive mode: run all PEs concurrently, flush, reduce and print
/// results plus every counter.
fn run_batch(system: &System) -> ExitCode {
    if let Err(e) = system.run() {
        eprintln!("error: run failed: {e}");
        return ExitCode::FAILURE;
    }
    let (total, expected) = match (system.reduce(), system.expected()) {
        (Ok(t), Ok(e)) => (t, e),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("error: result readback failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    for pe in 0..system.layout.p {
        match system.mem.load_f64(system.layout.s_addr(pe)) {
            Ok(v) => println!("PE{pe} partial sum = {v}"),
            Err(e) => println!("PE{pe} partial sum unreadable: {e}"),
        }
    }
    println!("dot product (final reduction) = {total}");
    println!("dot product (sequential expected) = {expected}");

    println!("\nPer-cache statistics:");
    for cache in &system.caches {
        println!("PE{}: {}", cache.pe_id(), cache.stats());
    }
    println!("memory: {}", system.mem.stats());

    if (total - expected).abs() < 1e-10 {
        ExitCode::SUCCESS
    } else {
        eprintln!("error: dot product mismatch");
        ExitCode::FAILURE
    }
}
