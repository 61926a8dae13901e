mod config;
mod db;
mod error;
mod feed;
mod logging;
mod neo;
mod pipeline;

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use config::RunArgs;
use feed::StopReason;
use pipeline::RunOutcome;

#[derive(Parser)]
#[command(name = "neo_ingest", about = "NASA near-Earth object feed ingester")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "NEO_DB_PATH", default_value = config::DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Also write logs to this file
    #[arg(long, global = true, env = "NEO_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the asteroid tables
    Init,
    /// Fetch the feed window and store it
    Run(RunArgs),
    /// Show table totals
    Stats,
    /// Search stored close approaches
    Approaches {
        /// Earliest approach date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Latest approach date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Maximum miss distance in lunar distances
        #[arg(long)]
        max_lunar: Option<f64>,
        /// Only potentially hazardous asteroids
        #[arg(long)]
        hazardous: bool,
        /// Only approaches to Earth
        #[arg(long)]
        earth: bool,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Init => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            println!("Schema ready in {}", cli.db.display());
            Ok(())
        }
        Commands::Run(args) => {
            let config = args.into_config(&cli.db)?;
            let report = pipeline::run(&config).await?;

            let fetch = &report.fetch;
            let ending = match fetch.stop {
                StopReason::TargetReached => "target reached",
                StopReason::Exhausted => "feed exhausted",
                StopReason::Failed => "stopped early",
            };
            println!(
                "Fetched {} records from {} pages ({}, {} malformed skipped)",
                fetch.records, fetch.pages, ending, fetch.skipped
            );
            if let Some(e) = &fetch.error {
                println!("Fetch error: {}", e);
            }

            match report.outcome {
                RunOutcome::NoRecords => println!("No data fetched; nothing stored."),
                RunOutcome::Persisted(p) => {
                    println!("Asteroids inserted:        {}", p.inserted_objects);
                    println!("Close approaches inserted: {}", p.inserted_approaches);
                    if p.refreshed_objects > 0 {
                        println!("Asteroids refreshed:       {}", p.refreshed_objects);
                    }
                    if p.skipped > 0 {
                        println!("Records skipped:           {}", p.skipped);
                    }
                }
            }
            println!("Execution time: {}", format_duration(report.elapsed));
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Asteroids:     {}", s.asteroids);
            println!("Approaches:    {}", s.approaches);
            println!("Hazardous:     {}", s.hazardous);
            match s.max_velocity_kmph {
                Some(v) => println!("Max velocity:  {:.0} km/h", v),
                None => println!("Max velocity:  -"),
            }
            Ok(())
        }
        Commands::Approaches {
            from,
            to,
            max_lunar,
            hazardous,
            earth,
            limit,
        } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let filter = db::ApproachFilter {
                from,
                to,
                max_lunar,
                hazardous_only: hazardous,
                earth_only: earth,
                limit,
            };
            let rows = db::search_approaches(&conn, &filter)?;
            if rows.is_empty() {
                println!("No close approaches found.");
                return Ok(());
            }

            println!(
                "{:>8} | {:<24} | {:<10} | {:>10} | {:>8} | {:>8} | {:>7} | {:<3} | {:<8}",
                "Id", "Asteroid", "Date", "km/h", "AU", "LD", "Diam km", "PHA", "Body"
            );
            println!("{}", "-".repeat(111));

            for r in &rows {
                println!(
                    "{:>8} | {:<24} | {:<10} | {:>10.0} | {:>8.4} | {:>8.2} | {:>7.3} | {:<3} | {:<8}",
                    r.id,
                    truncate(&r.name, 24),
                    r.date,
                    r.velocity_kmph,
                    r.miss_distance_au,
                    r.miss_distance_lunar,
                    r.diameter_max_km,
                    if r.hazardous { "yes" } else { "no" },
                    truncate(&r.orbiting_body, 8),
                );
            }

            println!("\n{} approaches", rows.len());
            Ok(())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
