// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! telemstore — tiered telemetry store daemon
//!
//! Usage:
//!   telemstore run            --config config.toml
//!   telemstore stats          --config config.toml
//!   telemstore clear-history  --config config.toml --yes

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemstore::config::Config;
use telemstore::maintenance;
use telemstore::store::TelemetryStore;

#[derive(Parser)]
#[command(name = "telemstore", about = "Tiered telemetry store", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover the spool, start the store and the maintenance task.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a memory/disk statistics snapshot and exit.
    Stats {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Delete every spool file and reset disk indices. Destructive.
    ClearHistory {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Confirm the destructive wipe.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            run_store(config).await;
        }
        Command::Stats { config } => {
            run_stats(config);
        }
        Command::ClearHistory { config, yes } => {
            run_clear_history(config, yes);
        }
    }
}

fn load_config(config_path: &PathBuf) -> Config {
    match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

async fn run_store(config_path: PathBuf) {
    let cfg = load_config(&config_path);

    info!(
        sensors = cfg.sensors.len(),
        base_path = ?cfg.storage.base_path,
        sector_count = cfg.storage.sector_count,
        pressure_free_pct = cfg.storage.pressure_free_pct,
        "Starting telemetry store"
    );

    let store = match TelemetryStore::open(&cfg) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to open store");
            std::process::exit(1);
        }
    };

    let handle = maintenance::spawn_maintenance(store.clone(), cfg.maintenance.clone());

    // Producers (CAN ingest) and upload consumers attach through the
    // library API; the daemon itself just keeps the tiers healthy.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }

    handle.shutdown(&store).await;
    let stats = store.memory_statistics();
    info!(
        ram_used = stats.ram_sectors_used,
        disk_files = stats.disk_files,
        dropped = stats.dropped_writes,
        "Store stopped"
    );
}

fn run_stats(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    let store = match TelemetryStore::open(&cfg) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let stats = store.memory_statistics();
    let recovery = store.recovery_report();

    println!("=== Telemetry Store Statistics ===");
    println!(
        "RAM sectors : {} used / {} free / {} total",
        stats.ram_sectors_used, stats.ram_sectors_free, stats.ram_sectors_total
    );
    println!("RAM records : {}", stats.total_records);
    println!(
        "Disk        : {} files, {} records ({} quarantined)",
        stats.disk_files, stats.total_disk_records, stats.quarantined_files
    );
    println!(
        "Counters    : {} dropped writes, {} migrated sectors, {} disk errors",
        stats.dropped_writes, stats.migrated_sectors, stats.disk_io_errors
    );
    println!(
        "Recovery    : {} files / {} records indexed, {} stale temp removed",
        recovery.files_indexed, recovery.records_indexed, recovery.stale_tmp_removed
    );
    for (src, pending) in &stats.per_source_pending {
        println!("Pending[{src}] : {pending}");
    }

    println!();
    println!("{:<6} {:<20} {:<5} {:<12} {:<12}", "ID", "Name", "Kind", "RAM records", "Sectors");
    println!("{}", "-".repeat(60));
    for id in store.sensor_ids() {
        match store.sensor_statistics(id) {
            Ok(s) => {
                println!(
                    "{:<6} {:<20} {:<5} {:<12} {:<12}",
                    s.id,
                    s.name,
                    format!("{:?}", s.kind),
                    s.ram_records,
                    s.ram_sectors,
                );
                for row in &s.per_source {
                    println!(
                        "       → {:<9} new {:<6} pending {:<6} disk {:<6}",
                        row.source.tag(),
                        row.new_records,
                        row.pending_records,
                        row.disk_records,
                    );
                }
            }
            Err(e) => eprintln!("sensor {id}: {e}"),
        }
    }
    println!("\nSnapshot at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
}

fn run_clear_history(config_path: PathBuf, yes: bool) {
    let cfg = load_config(&config_path);
    if !yes {
        eprintln!(
            "Refusing to wipe {} without --yes",
            cfg.storage.base_path.display()
        );
        std::process::exit(1);
    }

    let store = match TelemetryStore::open(&cfg) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    match store.clear_all_history() {
        Ok(()) => {
            println!("Spool history cleared under {}", cfg.storage.base_path.display());
        }
        Err(e) => {
            eprintln!("Clear history failed: {e}");
            std::process::exit(1);
        }
    }
}
