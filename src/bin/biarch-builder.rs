use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use biarch_builder::preflight::require_root;
use biarch_builder::{BuildConfig, BuildPipeline, BuildRequest, ErrorKind, SystemRunner};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn usage() -> &'static str {
    "Usage:\n  biarch-builder <x86-live-image> <x64-live-image> <output-image>\n\n\
     Merges two Live images into one bootable disk image with an extlinux\n\
     menu entry per architecture. Must be run as root."
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [x86, x64, output] = args.as_slice() else {
        eprintln!("{}", usage());
        return ExitCode::from(EXIT_USAGE);
    };

    let config = BuildConfig::default();
    let request = match BuildRequest::new(
        vec![PathBuf::from(x86), PathBuf::from(x64)],
        Some(PathBuf::from(output)),
        &config.arch_labels,
    ) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("error: {}\n\n{}", e, usage());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if let Err(e) = require_root() {
        eprintln!("error: {}", e);
        return ExitCode::from(EXIT_FAILURE);
    }

    let interrupt = match register_signals() {
        Ok(flag) => flag,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match BuildPipeline::new(&SystemRunner, config, request)
        .with_interrupt(interrupt)
        .run()
    {
        Ok(report) => {
            info!(
                output = %report.output.display(),
                bytes = report.image_bytes,
                "done"
            );
            println!("{}", report.output.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            match e.kind() {
                ErrorKind::Usage => ExitCode::from(EXIT_USAGE),
                ErrorKind::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// SIGINT, SIGTERM and SIGHUP set a flag the pipeline checks between
/// stages, so teardown still runs after a signal.
fn register_signals() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
    ] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .with_context(|| format!("registering handler for signal {}", signal))?;
    }
    Ok(flag)
}
