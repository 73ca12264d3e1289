//! CLI for comparing serial and parallel scheduling.

use clap::Parser;
use exec_harness::{
    ExecutionResult, Executor, HarnessError, ParallelExecutor, SerialExecutor, Workload,
    WorkloadConfig,
};
use std::process::ExitCode;
use tracing::{error, Level};

#[derive(Parser, Debug)]
#[command(
    name = "exec-harness",
    about = "Runs intkey workloads through the serial and parallel schedulers",
    version
)]
struct Cli {
    /// Counters in the initial state.
    #[arg(long, default_value_t = 1000)]
    keys: usize,

    /// Batches per workload.
    #[arg(long, default_value_t = 250)]
    batches: usize,

    /// Transactions per batch.
    #[arg(long, default_value_t = 4)]
    txns_per_batch: usize,

    /// Probability that a transaction is rejected by the handler.
    #[arg(long, default_value_t = 0.0)]
    invalid_rate: f64,

    /// Worker threads for the parallel scheduler.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("=== Speculative Execution Benchmark ===\n");

    let configs = [
        ("No conflicts", 0.0),
        ("25% conflicts", 0.25),
        ("50% conflicts", 0.5),
        ("75% conflicts", 0.75),
        ("Full conflicts", 1.0),
    ];

    println!(
        "Configuration: {} keys, {} batches x {} transactions, {} workers\n",
        cli.keys, cli.batches, cli.txns_per_batch, cli.workers
    );

    let serial = SerialExecutor::new();
    let parallel = ParallelExecutor::new(cli.workers);
    let mut diverged = false;

    for &(name, conflict_factor) in &configs {
        let workload = match Workload::generate(WorkloadConfig {
            num_keys: cli.keys,
            num_batches: cli.batches,
            txns_per_batch: cli.txns_per_batch,
            conflict_factor,
            invalid_rate: cli.invalid_rate,
            seed: cli.seed,
        }) {
            Ok(workload) => workload,
            Err(e) => {
                error!(workload = name, error = %e, "failed to generate workload");
                return ExitCode::FAILURE;
            }
        };

        let results = match (run(&serial, &workload, name), run(&parallel, &workload, name)) {
            (Ok(s), Ok(p)) => (s, p),
            (Err(e), _) | (_, Err(e)) => {
                error!(workload = name, error = %e, "execution failed");
                return ExitCode::FAILURE;
            }
        };
        if results.0.state_root != results.1.state_root {
            error!(
                workload = name,
                serial = %results.0.state_root,
                parallel = %results.1.state_root,
                "state roots diverged"
            );
            diverged = true;
        }
    }

    if diverged {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(
    executor: &dyn Executor,
    workload: &Workload,
    name: &str,
) -> Result<ExecutionResult, HarnessError> {
    let result = executor.execute(workload)?;
    let elapsed = result.stats.duration;
    let tps = workload.num_transactions() as f64 / elapsed.as_secs_f64();

    println!(
        "{:16} | {:8} | {:4} valid | {:4} invalid | {:8.2} ms | {:8.0} tx/s",
        name,
        executor.name(),
        result.valid_batches,
        result.invalid_batches,
        elapsed.as_secs_f64() * 1000.0,
        tps
    );
    Ok(result)
}
