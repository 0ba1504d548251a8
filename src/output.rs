use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::ingest::{Phase, ProgressEvent, ProgressSink, UpdateSummary};
use crate::search::Resolution;
use crate::store::StoreStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_update(summary: &UpdateSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_resolution(resolution: Option<&Resolution>) -> io::Result<()> {
        Self::print_json(&resolution)
    }

    pub fn print_stats(stats: &StoreStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards ingestion progress to the log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        let elapsed_ms = event.elapsed.map(|elapsed| elapsed.as_millis() as u64);
        match event.phase {
            Phase::Listing | Phase::Downloading | Phase::Done => {
                info!(phase = %event.phase, elapsed_ms, "{}", event.message)
            }
            _ => debug!(phase = %event.phase, elapsed_ms, "{}", event.message),
        }
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_update(summary: &UpdateSummary) {
        println!(
            "Archives: {} listed, {} processed, {} skipped, {} failed",
            summary.listed, summary.processed, summary.skipped, summary.failed
        );
        println!(
            "Records:  {} inserted, {} dropped",
            summary.records_inserted, summary.records_dropped
        );
        if summary.aborted {
            println!("Run stopped early after repeated failures; rerun to resume.");
        }
    }

    pub fn print_resolution(resolution: &Resolution) {
        println!("[source: {}]", resolution.source);
        for (idx, record) in resolution.records.iter().enumerate() {
            if resolution.records.len() > 1 {
                println!("-- match {} --", idx + 1);
            }
            for (key, value) in record {
                println!("{key:>18}: {}", display_value(value));
            }
        }
    }

    pub fn print_stats(stats: &StoreStats) {
        println!("Store:              {}", stats.path);
        println!("Compounds:          {}", stats.compounds);
        println!("Processed archives: {}", stats.processed_archives);
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
