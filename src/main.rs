//! Leaderless BFT demo
//!
//! Runs one cluster of 3f+1 processes inside this process and prints what
//! every process decides.
//!
//! ```bash
//! # Four processes over in-memory channels, inputs 10 20 20 20
//! leaderless-bft
//!
//! # Seven processes with signed answers
//! leaderless-bft --faults 2 --signed 1 2 3 4 5 6 7
//!
//! # The same cluster in the deterministic simulator
//! leaderless-bft --seed 42 a b a b
//! ```
//!
//! Set RUST_LOG (e.g. RUST_LOG=debug) to follow rank and step transitions.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use leaderless_bft::common::Config;
use leaderless_bft::consensus::Value;
use leaderless_bft::network::sim::Simulation;
use leaderless_bft::network::spawn_cluster;

const SIMULATION_BUDGET: usize = 1_000_000;

/// Leaderless BFT agreement among 3f+1 processes
#[derive(Parser, Debug)]
#[command(name = "leaderless-bft")]
#[command(version, about, long_about = None)]
struct Args {
    /// Faults tolerated; the cluster has 3f+1 processes
    #[arg(short = 'f', long, default_value = "1")]
    faults: usize,

    /// Sign and check every answer with ed25519
    #[arg(long)]
    signed: bool,

    /// Run in the deterministic simulator with this seed
    #[arg(long)]
    seed: Option<u64>,

    /// One input per process; numbers compare numerically. Defaults to one
    /// process proposing 10 and the rest 20
    inputs: Vec<String>,
}

impl Args {
    fn values(&self, config: &Config) -> Vec<Value> {
        if self.inputs.is_empty() {
            return config
                .members()
                .map(|id| Value::from(if id == 0 { 10u64 } else { 20 }))
                .collect();
        }
        self.inputs
            .iter()
            .map(|input| {
                input
                    .parse::<u64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(input.as_str()))
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::for_faults(args.faults);
    let inputs = args.values(&config);

    match args.seed {
        Some(seed) => simulate(config, inputs, seed, args.signed),
        None => run_cluster(config, inputs, args.signed).await,
    }
}

async fn run_cluster(config: Config, inputs: Vec<Value>, signed: bool) -> ExitCode {
    let mut nodes = match spawn_cluster(&config, inputs, signed) {
        Ok(nodes) => nodes,
        Err(error) => {
            eprintln!("cannot start cluster: {}", error);
            return ExitCode::FAILURE;
        }
    };

    for node in nodes.iter_mut() {
        match node.decided().await {
            Some((rank, value)) => {
                println!("process {} decided {} at rank {}", node.id, value, rank)
            }
            None => println!("process {} stopped without deciding", node.id),
        }
    }

    for node in nodes {
        node.shutdown().await;
    }
    ExitCode::SUCCESS
}

fn simulate(config: Config, inputs: Vec<Value>, seed: u64, signed: bool) -> ExitCode {
    let mut simulation = Simulation::new(config, inputs, seed);
    if signed {
        simulation = simulation.signed();
    }
    let outcome = match simulation.run(SIMULATION_BUDGET) {
        Ok(outcome) => outcome,
        Err(error) => {
            eprintln!("cannot start simulation: {}", error);
            return ExitCode::FAILURE;
        }
    };

    for (id, (rank, value)) in &outcome.decisions {
        println!("process {} decided {} at rank {}", id, value, rank);
    }
    println!("{} messages delivered", outcome.delivered);
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["leaderless-bft"]).unwrap();
        assert_eq!(args.faults, 1);
        assert!(!args.signed);
        assert_eq!(args.seed, None);

        let config = Config::for_faults(args.faults);
        let values = args.values(&config);
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], Value::from(10u64));
        assert_eq!(values[3], Value::from(20u64));
    }

    #[test]
    fn test_args_inputs_and_flags() {
        let args =
            Args::try_parse_from(["leaderless-bft", "--signed", "-f", "2", "--seed", "7", "5", "x"])
                .unwrap();
        assert!(args.signed);
        assert_eq!(args.faults, 2);
        assert_eq!(args.seed, Some(7));
        assert_eq!(
            args.values(&Config::for_faults(2)),
            vec![Value::from(5u64), Value::from("x")]
        );
    }

    #[test]
    fn test_args_rejects_unknown_flags() {
        assert!(Args::try_parse_from(["leaderless-bft", "--bogus"]).is_err());
    }
}
