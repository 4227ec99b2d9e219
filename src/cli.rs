use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pkgops - run declarative package operations with pacman or paru
#[derive(Parser)]
#[command(name = "pkgops")]
#[command(about = "Install and remove packages from a JSON operation list")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a job
    Run {
        /// Path to the job configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Extra operations (JSON array) to run after the configured ones
        #[arg(long)]
        operations: Option<PathBuf>,

        /// Locale substituted for ${LOCALE} in package names
        #[arg(short, long, default_value = "en")]
        locale: String,

        /// Network is available (enables db refresh, upgrade and sync)
        #[arg(long, conflicts_with = "offline")]
        online: bool,

        /// Network is not available
        #[arg(long)]
        offline: bool,

        /// Root of the target system; commands run through chroot
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Print progress updates as JSON lines on stdout
        #[arg(long)]
        progress_json: bool,
    },
    /// Validate a job configuration file
    Validate {
        /// Path to the job configuration to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
