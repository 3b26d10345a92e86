use anyhow::{Context, Result};
use clap::Parser;
use packtrace::analysis::UsageSummary;
use packtrace::cli::Cli;
use packtrace::config::TraceConfig;
use packtrace::sim::{SimImage, SimRuntime};
use packtrace::trace_workload;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration from --config, or discovered next to the script
fn load_config(args: &Cli) -> Result<TraceConfig> {
    let mut config = match &args.config {
        Some(path) => TraceConfig::from_file(path)?,
        None => TraceConfig::discover(&args.script)?.unwrap_or_default(),
    };
    if let Some(packages) = &args.packages {
        config.requires = packages.clone();
    }
    if args.snapshot_before {
        config.snapshot_before = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let config = load_config(&args)?;
    let image = SimImage::from_file(&args.image)?;
    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read workload: {}", args.script.display()))?;

    let mut runtime = SimRuntime::new(image);
    let outcome = trace_workload(&mut runtime, &config, &source)?;

    for line in runtime.output() {
        eprintln!("[guest] {}", line);
    }
    if outcome.used_installer_fallback {
        eprintln!(
            "[packtrace: packages installed through {}]",
            config.installer
        );
    }
    if let Some(err) = &outcome.workload_error {
        eprintln!("[packtrace: workload failed: {}]", err);
        eprintln!("[packtrace: manifest is partial]");
    }

    if let Some(path) = &args.summary {
        let summary = UsageSummary::from_manifest(&outcome.manifest, &config.exclude_filter()?);
        std::fs::write(path, summary.to_json()?)
            .with_context(|| format!("Failed to write summary: {}", path.display()))?;
        eprintln!("[packtrace: summary written to {}]", path.display());
    }

    match &args.output {
        Some(path) => {
            outcome
                .manifest
                .write_to(path)
                .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
            eprintln!("[packtrace: manifest written to {}]", path.display());
        }
        None => println!("{}", outcome.manifest.to_json()?),
    }

    Ok(())
}
