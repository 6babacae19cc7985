// Run summary and its output formats

use std::time::Duration;

use permits::{CounterValues, DispatchError, DispatchResult};
use serde::Serialize;

#[derive(Clone, Copy)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// How each submission ended
#[derive(Debug, Default, Serialize)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub rate_limited: u64,
    pub buffer_full: u64,
    pub expired: u64,
    pub timeout: u64,
    pub execution_failed: u64,
    pub shutdown: u64,
}

impl OutcomeCounts {
    pub fn record<T>(&mut self, result: &DispatchResult<T>) {
        match result {
            Ok(_) => self.completed += 1,
            Err(DispatchError::RateLimited { .. }) => self.rate_limited += 1,
            Err(DispatchError::BufferFull { .. }) => self.buffer_full += 1,
            Err(DispatchError::Expired { .. }) => self.expired += 1,
            Err(DispatchError::Timeout { .. }) => self.timeout += 1,
            Err(DispatchError::ExecutionFailed(_)) => self.execution_failed += 1,
            Err(DispatchError::Shutdown) => self.shutdown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed
            + self.rate_limited
            + self.buffer_full
            + self.expired
            + self.timeout
            + self.execution_failed
            + self.shutdown
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub kind: String,
    pub submitted: u64,
    pub elapsed_ms: u64,
    pub outcomes: OutcomeCounts,
    pub totals: CounterValues,
}

impl RunSummary {
    pub fn new(kind: String, elapsed: Duration, outcomes: OutcomeCounts, totals: CounterValues) -> Self {
        Self {
            kind,
            submitted: outcomes.total(),
            elapsed_ms: elapsed.as_millis() as u64,
            outcomes,
            totals,
        }
    }

    pub fn print(&self, format: OutputFormat) -> anyhow::Result<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(self)?),
            OutputFormat::Text => self.print_text(),
        }
        Ok(())
    }

    fn print_text(&self) {
        print_field("Workload", &self.kind);
        print_field("Submitted", &self.submitted.to_string());
        print_field("Elapsed", &format!("{}ms", self.elapsed_ms));
        println!();

        let o = &self.outcomes;
        let rows = [
            ("completed", o.completed),
            ("rate limited", o.rate_limited),
            ("buffer full", o.buffer_full),
            ("expired", o.expired),
            ("timeout", o.timeout),
            ("failed", o.execution_failed),
            ("shutdown", o.shutdown),
        ];
        println!("{:<16} {:>10} {:>8}", "OUTCOME", "COUNT", "SHARE");
        for (label, count) in rows {
            let share = if self.submitted == 0 {
                0.0
            } else {
                count as f64 * 100.0 / self.submitted as f64
            };
            println!("{label:<16} {count:>10} {share:>7.1}%");
        }
    }
}

fn print_field(label: &str, value: &str) {
    println!("{:<12} {}", format!("{}:", label), value);
}
