//! CLI argument parsing for Packtrace

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "packtrace")]
#[command(version)]
#[command(about = "Record the files, dynamic libraries and symbols a workload uses", long_about = None)]
pub struct Cli {
    /// Runtime image to start (TOML)
    #[arg(short = 'i', long = "image", value_name = "IMAGE")]
    pub image: PathBuf,

    /// Trace configuration (packtrace.toml or pyproject.toml); discovered next to the script by default
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Packages to preload, replacing the configured list (e.g. --packages numpy,scipy)
    #[arg(short = 'p', long = "packages", value_name = "PKGS", value_delimiter = ',')]
    pub packages: Option<Vec<String>>,

    /// Snapshot the module registry before the workload runs as well
    #[arg(long = "snapshot-before")]
    pub snapshot_before: bool,

    /// Write the manifest here instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also write the packer summary (configured exclusions applied) here
    #[arg(long = "summary", value_name = "FILE")]
    pub summary: Option<PathBuf>,

    /// Enable debug tracing output on stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Workload script to execute
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,
}
