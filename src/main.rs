/*!
 * Salvage - resumable phone backup over fragile transports
 *
 * Command-line entry point. Wires the CLI flags into the engine, installs
 * the Ctrl-C handler and maps outcomes to exit codes: 0 on success, 1 on
 * verify failures or file-level errors, 130 after cancellation.
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};

use salvage::{BackupConfig, ConsoleReporter, Engine, Mode, RunOutcome, VERSION};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let matches = Command::new("Salvage")
        .version(VERSION)
        .about("Resumable backup of Android phones over MTP/GVFS mounts or ADB")
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("PATH")
                .help("Source root on the device (mount point or device path)")
                .required(true),
        )
        .arg(
            Arg::new("dest")
                .short('d')
                .long("dest")
                .value_name("PATH")
                .help("Destination root for the backup")
                .required(true),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Operating mode: mount, adb, verify or cleanup")
                .default_value("mount"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("COUNT")
                .help("Number of copy workers (keep at 4 or below for MTP)")
                .default_value("1"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let mode = Mode::parse(matches.get_one::<String>("mode").expect("has default"))
        .context("invalid --mode")?;
    let workers: usize = matches
        .get_one::<String>("workers")
        .expect("has default")
        .parse()
        .context("invalid --workers")?;

    let config = BackupConfig {
        source_root: PathBuf::from(matches.get_one::<String>("source").expect("required")),
        dest_root: PathBuf::from(matches.get_one::<String>("dest").expect("required")),
        mode,
        workers,
        verbose: matches.get_flag("verbose"),
        ..Default::default()
    };

    salvage::logging::init_logging(config.verbose).context("failed to initialize logging")?;

    let reporter = Arc::new(ConsoleReporter::new());
    let engine =
        Engine::new(config.clone(), reporter.clone()).context("failed to initialize engine")?;

    let token = engine.token();
    ctrlc::set_handler(move || {
        eprintln!("\ninterrupt received, finishing current copies...");
        token.cancel();
    })
    .context("failed to install interrupt handler")?;

    let code = match mode {
        Mode::Mount | Mode::Adb => run_backup(&engine)?,
        Mode::Verify => {
            let report = engine.verify().context("verify pass failed")?;
            println!("{}", report.render());
            if report.is_clean() {
                0
            } else {
                1
            }
        }
        Mode::Cleanup => {
            let report = engine.cleanup().context("cleanup pass failed")?;
            println!("{}", report.render());
            if report.failures == 0 {
                0
            } else {
                1
            }
        }
    };

    reporter.finish();
    let summary = engine.error_summary();
    if !summary.is_empty() {
        eprintln!("{}", summary.render());
    }
    Ok(code)
}

fn run_backup(engine: &Engine) -> Result<i32> {
    let outcome = engine.run().context("backup run failed")?;
    let stats = outcome.stats();

    println!(
        "\n{} copied, {} failed, {} skipped, {} stalled, {} transferred",
        stats.completed,
        stats.failed,
        stats.skipped,
        stats.timeouts,
        salvage::reporter::format_bytes(stats.bytes)
    );

    match outcome {
        RunOutcome::ConnectionLost(_) => {
            eprintln!(
                "connection to the device was lost; reconnect it and re-run to resume"
            );
            Ok(1)
        }
        RunOutcome::Cancelled(_) => Ok(130),
        RunOutcome::Completed(_) => {
            let report = engine.verify().context("verify pass failed")?;
            println!("{}", report.render());
            if report.is_clean() && !stats.has_failures() {
                Ok(0)
            } else {
                Ok(1)
            }
        }
    }
}
