//! skyprint: fingerprint astronomical image cutouts and search for similar
//! regions.
//!
//! # Usage
//!
//! ```text
//! skyprint run --cutout blob --similarity tsne --workers 4 m31.png m33.png
//! skyprint query --index 12 -k 8 --records records.json --export-dir neighbours
//! ```
//!
//! Logging goes to stderr and honours `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout)]

mod cli;
mod commands;
mod config;
mod error;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, QueryArgs, RunArgs};
use crate::error::CliError;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match &cli.command {
        Command::Run(args) => run(args),
        Command::Query(args) => query(args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RunArgs) -> Result<(), CliError> {
    let config = args.config()?;
    tracing::debug!(?config, "run configuration");

    let summary = commands::run(&args.images, &config, &args.records, &args.similarity_out)?;
    println!(
        "{} image(s), {} fingerprint(s) -> {}",
        summary.images,
        summary.fingerprints,
        args.records.display(),
    );
    if let Some(name) = summary.similarity {
        println!("{name} similarity -> {}", args.similarity_out.display());
    }
    Ok(())
}

fn query(args: &QueryArgs) -> Result<(), CliError> {
    let export = args.records.as_deref().zip(args.export_dir.as_deref());
    let neighbors = commands::query(&args.similarity, args.query(), args.neighbors, export)?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&neighbors).map_err(skyprint_io::IoError::from)?
        );
        return Ok(());
    }

    println!("{:>6} {:>12}  {:<36}  bounds", "index", "score", "image");
    for n in &neighbors {
        println!(
            "{:>6} {:>12.6}  {:<36}  {}",
            n.index,
            n.score,
            n.fingerprint.image.to_string(),
            n.fingerprint.bounds
        );
    }
    Ok(())
}
