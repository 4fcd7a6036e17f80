//! Report rendering: tables for humans, JSON and Prometheus text for tools.

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde::Serialize;
use veclock_core::StatsSnapshot;

use crate::workload::{CycleOutcome, CycleReport, StressReport};

/// Output format selected with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    /// Prometheus text exposition of the statistics only
    Prometheus,
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|h| Cell::new(h)));
    table
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Builds the statistics table shared by every report.
pub fn stats_table(stats: &StatsSnapshot) -> Table {
    let mut table = new_table(&["Metric", "Value"]);
    let rows: [(&str, String); 16] = [
        ("acquisitions", stats.acquisitions.to_string()),
        ("releases", stats.releases.to_string()),
        ("currently held", stats.currently_held.to_string()),
        ("contentions", stats.contentions.to_string()),
        ("busy", stats.busy.to_string()),
        ("interrupted", stats.interrupted.to_string()),
        ("deadlocks detected", stats.deadlocks_detected.to_string()),
        ("deadlocks prevented", stats.deadlocks_prevented.to_string()),
        ("deadlock victims", stats.deadlock_victims.to_string()),
        ("edges broken", stats.edges_broken.to_string()),
        (
            "cache hit rate",
            format!("{:.1}%", stats.cache_hit_rate * 100.0),
        ),
        (
            "per-node allocations",
            format!("{:?}", stats.per_node_allocations),
        ),
        ("live locks", stats.live_locks.to_string()),
        ("locks reclaimed", stats.locks_reclaimed.to_string()),
        ("lock-free retries", stats.lock_free.retries.to_string()),
        ("lock-free exhausted", stats.lock_free.exhausted.to_string()),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    table
}

pub fn print_stress(report: &StressReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Prometheus => {
            print!("{}", report.stats.to_prometheus());
            Ok(())
        }
        OutputFormat::Table => {
            println!(
                "{} {} ops on {} threads in {} ms ({:.0} ops/s)",
                "Stress:".bold(),
                report.operations,
                report.threads,
                report.elapsed_ms,
                report.ops_per_sec
            );
            let lost = if report.lost_updates == 0 {
                "0".green()
            } else {
                report.lost_updates.to_string().red().bold()
            };
            println!(
                "  granted {}, busy {}, lost updates {}\n",
                report.granted.to_string().green(),
                report.busy.to_string().yellow(),
                lost
            );
            println!("{}", stats_table(&report.stats));
            Ok(())
        }
    }
}

pub fn print_cycle(report: &CycleReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Prometheus => {
            print!("{}", report.stats.to_prometheus());
            Ok(())
        }
        OutputFormat::Table => {
            println!(
                "{} {:?} policy, resolved in {} ms\n",
                "Cycle:".bold(),
                report.policy,
                report.elapsed_ms
            );
            let mut table = new_table(&["Thread", "Holds", "Requests", "Outcome"]);
            for p in &report.participants {
                let outcome = match p.outcome {
                    CycleOutcome::Granted => p.outcome.as_str().green(),
                    CycleOutcome::Victim | CycleOutcome::Refused => p.outcome.as_str().red(),
                };
                table.add_row(vec![
                    Cell::new(p.thread),
                    Cell::new(p.held),
                    Cell::new(p.requested),
                    Cell::new(outcome),
                ]);
            }
            println!("{table}\n");
            println!("{}", stats_table(&report.stats));
            Ok(())
        }
    }
}
