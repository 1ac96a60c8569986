//! `cckdcdsk`: offline repair tool for compressed-CKD DASD images (spec
//! §4.3, "Repair-engine CLI").
//!
//! Exit codes mirror the original `cckdcdsk` utility: 0 is clean, a
//! positive code is the number of structural changes the repair made,
//! a negative (here: 255, the wrapped `-1`) means the image could not
//! be repaired or a host I/O error aborted the run.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cckd::{chkdsk, CheckLevel};

#[derive(Parser, Debug)]
#[command(name = "cckdcdsk", about = "Check and repair a compressed-CKD DASD image")]
struct Args {
    /// Check level: 0 (fast), 1 (default), or 3 (exhaustive).
    #[arg(short = 'l', long = "level", default_value_t = 1)]
    level: u8,

    /// Path to the compressed-CKD image file.
    file: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cckdcdsk=debug")))
        .init();

    let args = Args::parse();

    let level = match CheckLevel::from_u8(args.level) {
        Ok(l) => l,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(255);
        }
    };

    let file = match OpenOptions::new().read(true).write(true).open(&args.file) {
        Ok(f) => f,
        Err(e) => {
            error!(file = %args.file.display(), "failed to open image: {e}");
            return ExitCode::from(255);
        }
    };

    info!(file = %args.file.display(), level = args.level, "running repair engine");

    match chkdsk(file, level) {
        Ok(0) => {
            info!("image is clean, no changes made");
            ExitCode::from(0)
        }
        Ok(n) => {
            info!(changes = n, "image repaired");
            ExitCode::from(n.min(255) as u8)
        }
        Err(e) => {
            error!("image is unrepairable: {e}");
            ExitCode::from(255)
        }
    }
}
