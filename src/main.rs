//! Sample deploy program
//!
//! Deploys one resource set and prints `OK!: <path>` as the final stdout
//! line on success; prints the error and exits non-zero otherwise. The
//! multi-process integration tests drive this binary concurrently.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use unbundle::{Bundle, Deployer};

/// Deploy embedded native resources to a local directory.
#[derive(Parser, Debug)]
#[command(name = "unbundle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Resource path template, e.g. "resources/$(OS)/$(ARCH)/*"
    from: String,

    /// Deployment path template, e.g. "$(TEMP)/vendor/$(ARCH)"
    to: String,

    /// Bundle location (directory, archive.tar, or outer.tar!/inner.tar);
    /// defaults to the directory containing this executable
    #[arg(long)]
    bundle: Option<String>,

    /// Version string substituted for $(VERSION)
    #[arg(long)]
    bundle_version: Option<String>,

    /// Rewrite every file even when an intact deployment exists
    #[arg(long)]
    overwrite: bool,

    /// Complete a partial peer deployment instead of redoing it
    #[arg(long, conflicts_with = "overwrite")]
    reuse_partial: bool,

    /// Deploy only; do not load dynamic libraries
    #[arg(long)]
    no_load: bool,

    /// For an absolute path, fall back to a random subdirectory
    #[arg(long)]
    random_fallback: bool,

    /// Library name suffix inserted before the extension
    #[arg(long)]
    library_suffix: Option<String>,

    /// Lock/verify retry timeout in milliseconds (default derived from the
    /// total resource size)
    #[arg(long)]
    retry_timeout_ms: Option<u64>,
}

fn run(cli: Cli) -> Result<()> {
    let mut bundle = match &cli.bundle {
        Some(location) => Bundle::parse(location),
        None => Bundle::for_current_exe(),
    };
    if let Some(version) = &cli.bundle_version {
        bundle = bundle.with_version(version);
    }

    let mut deployer = Deployer::from_bundle(bundle, &cli.from)
        .to(&cli.to)
        .always_overwrite(cli.overwrite)
        .reuse_partially_deployed(cli.reuse_partial)
        .should_load_libraries(!cli.no_load)
        .try_random_fallback_subdirectory(cli.random_fallback);
    if let Some(suffix) = &cli.library_suffix {
        deployer = deployer.add_library_suffix(suffix);
    }
    if let Some(ms) = cli.retry_timeout_ms {
        deployer = deployer.retry_timeout(Duration::from_millis(ms));
    }

    let deployed = deployer.load()?;
    println!("OK!: {}", deployed.deployment_path().display());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
