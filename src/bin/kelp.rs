// Kelp CLI - Command Line Interface
// Usage: kelp BUNDLE [OPTIONS]

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use kelp_core::bundle::Bundle;
use kelp_core::config::VmConfig;
use kelp_core::vm::VM;

/// Kelp - run precompiled Kelp bundles
#[derive(Parser)]
#[command(name = "kelp")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a precompiled Kelp bundle", long_about = None)]
struct Cli {
    /// Bundle to run (.json)
    bundle: PathBuf,

    /// Print the disassembled entry function instead of running it
    #[arg(short = 'd', long = "disassemble")]
    disassemble: bool,

    /// JSON file with VM limits
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the maximum call depth
    #[arg(long = "max-frames")]
    max_frames: Option<usize>,

    /// Log filter, e.g. "kelp_core=debug" (defaults to KELP_LOG)
    #[arg(long = "log")]
    log: Option<String>,
}

fn init_logging(directive: Option<&str>) {
    let filter = match directive {
        Some(d) => EnvFilter::new(d),
        None => EnvFilter::try_from_env("KELP_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<VmConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("Error reading config '{}': {}", path.display(), e))?;
            VmConfig::from_json(&text)
                .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?
        }
        None => VmConfig::default(),
    };
    if let Some(max_frames) = cli.max_frames {
        config.max_frames = max_frames;
    }
    Ok(config)
}

async fn handle_run(cli: &Cli) -> Result<(), String> {
    let config = load_config(cli)?;
    let bundle = Bundle::from_path(&cli.bundle)
        .map_err(|e| format!("Error loading '{}': {}", cli.bundle.display(), e))?;

    let mut vm = VM::with_config(config);
    let entry = vm.load_bundle(bundle).map_err(|e| e.to_string())?;

    if cli.disassemble {
        print!("{}", entry.chunk.disassemble(&entry.name));
        return Ok(());
    }

    let source = entry.chunk.file.clone();
    let result = vm.run(entry).await.map_err(|e| {
        // Attach the source excerpt when the compiled file sits next to the bundle
        match fs::read_to_string(&source) {
            Ok(text) => e.with_source(&text).format(),
            Err(_) => e.format(),
        }
    })?;

    if !result.is_nil() {
        println!("{}", result);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if let Err(e) = handle_run(&cli).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
