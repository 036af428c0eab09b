use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use keel_config::{ConfigLoader, KeelConfig};

mod plugins;
mod start;
mod verify;

/// Keel: capability-scoped native plugin host
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to keel.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load plugins and run the host until interrupted (no host services are offered)
    Start {
        /// Never expose the UI service to plugins
        #[arg(long)]
        headless: bool,
    },
    /// Verify a detached manifest signature (exit 0 valid, 1 invalid, 2 error)
    Verify {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        sig: PathBuf,
        #[arg(long)]
        pubkey: PathBuf,
    },
    /// Check a plugin manifest for problems
    Validate {
        /// Path to a *.manifest.json file
        manifest: PathBuf,
    },
    /// Load plugins without running them and report their grants
    Plugins {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    /// Run the selected command and return the process exit code.
    pub async fn run(self) -> anyhow::Result<i32> {
        let loader = match ConfigLoader::load(self.config.as_deref()) {
            Ok(loader) => loader,
            // A broken config must not turn a signature check into a false "invalid".
            Err(e) if matches!(self.command, Commands::Verify { .. }) => {
                eprintln!("warning: ignoring config: {e}");
                ConfigLoader::from_config(KeelConfig::default())?
            }
            Err(e) => return Err(e).context("failed to load configuration"),
        };
        let config = loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(log_level, &config.logging.format);

        match self.command {
            Commands::Start { headless } => start::cmd_start(config, headless).await,
            Commands::Verify {
                manifest,
                sig,
                pubkey,
            } => Ok(verify::cmd_verify(&manifest, &sig, &pubkey)),
            Commands::Validate { manifest } => verify::cmd_validate(&manifest),
            Commands::Plugins { json } => plugins::cmd_plugins(&config, json),
            Commands::Config { json } => Self::cmd_config(&config, json, &loader),
            Commands::Version => Self::cmd_version(),
        }
    }

    fn cmd_config(config: &KeelConfig, json: bool, loader: &ConfigLoader) -> anyhow::Result<i32> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!("# {}", loader.path().display());
            println!("{}", toml::to_string_pretty(config)?);
        }
        Ok(0)
    }

    fn cmd_version() -> anyhow::Result<i32> {
        println!("keel {}", env!("CARGO_PKG_VERSION"));
        println!("  module extension: {}", std::env::consts::DLL_EXTENSION);
        Ok(0)
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let result = if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("warning: logging already initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verify_arguments() {
        let cli = Cli::try_parse_from([
            "keel", "verify", "--manifest", "m.json", "--sig", "m.sig", "--pubkey", "k.pub",
        ])
        .unwrap();
        match cli.command {
            Commands::Verify {
                manifest,
                sig,
                pubkey,
            } => {
                assert_eq!(manifest, PathBuf::from("m.json"));
                assert_eq!(sig, PathBuf::from("m.sig"));
                assert_eq!(pubkey, PathBuf::from("k.pub"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verify_requires_all_paths() {
        assert!(Cli::try_parse_from(["keel", "verify", "--manifest", "m.json"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["keel", "start", "--headless", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Start { headless: true }));
    }

    #[test]
    fn verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["keel", "-v", "-q", "version"]).is_err());
    }
}
