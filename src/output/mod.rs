//! Output boundary.
//!
//! Batching, sampling and delivery to a collector belong to whoever
//! implements [`Output`]. The agent only hands over finished records per
//! window and the occasional fatal error report.

mod types;

pub use types::*;

use std::io::Write;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;

pub trait Output: Send + Sync {
    /// Deliver one window worth of records produced by `source`.
    fn emit(&self, source: &str, category: Category, records: Vec<Point>) -> Result<()>;

    /// Surface a degraded-instrumentation error to remote monitoring.
    fn report_fatal_error(&self, source: &str, message: &str) -> Result<()>;
}

#[derive(Serialize)]
struct LogLine<'a> {
    source: &'a str,
    category: Category,
    #[serde(flatten)]
    point: &'a Point,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    source: &'a str,
    last_error: &'a str,
}

/// Writes every record as one JSON line.
pub struct LogOutput<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LogOutput<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl LogOutput<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Output for LogOutput<W> {
    fn emit(&self, source: &str, category: Category, records: Vec<Point>) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for point in &records {
            let line = serde_json::to_string(&LogLine {
                source,
                category,
                point,
            })?;
            writeln!(writer, "{line}").context("Failed to write record")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn report_fatal_error(&self, source: &str, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let line = serde_json::to_string(&ErrorLine {
            source,
            last_error: message,
        })?;
        writeln!(writer, "{line}").context("Failed to write error report")?;
        Ok(())
    }
}

/// Keeps everything in memory. Used by tests and by callers that want to
/// inspect what the agent produced.
#[derive(Default)]
pub struct MemoryOutput {
    records: Mutex<Vec<(String, Category, Point)>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, source: &str) -> Vec<Point> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(s, _, _)| s == source)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Output for MemoryOutput {
    fn emit(&self, source: &str, category: Category, records: Vec<Point>) -> Result<()> {
        let mut stored = self.records.lock().unwrap_or_else(|e| e.into_inner());
        stored.extend(records.into_iter().map(|p| (source.to_string(), category, p)));
        Ok(())
    }

    fn report_fatal_error(&self, source: &str, message: &str) -> Result<()> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((source.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_output_writes_json_lines() {
        let out = LogOutput::new(Vec::new());
        let mut p = Point::new("netflow", 42);
        p.tag("src_ip", "10.0.0.1").field("bytes_read", 10u64);
        out.emit("netflow", Category::Network, vec![p.clone(), p]).unwrap();
        out.report_fatal_error("offset", "calibration failed").unwrap();

        let buf = out.writer.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["source"], "netflow");
        assert_eq!(first["category"], "network");
        assert_eq!(first["tags"]["src_ip"], "10.0.0.1");
        assert_eq!(first["fields"]["bytes_read"], 10);
        assert!(lines[2].contains("calibration failed"));
    }

    #[test]
    fn test_memory_output_filters_by_source() {
        let out = MemoryOutput::new();
        out.emit("dnsflow", Category::Network, vec![Point::new("dnsflow", 1)])
            .unwrap();
        out.emit("netflow", Category::Network, vec![Point::new("netflow", 1)])
            .unwrap();
        assert_eq!(out.records("dnsflow").len(), 1);
        assert_eq!(out.records("netflow")[0].measurement, "netflow");
    }
}
