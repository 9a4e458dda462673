//! Trace reading and work estimation.
//!
//! A trace file is CSV-like text with one request per line:
//! a decimal arrival time in nanoseconds, a hex request size in bytes,
//! and the request kind ("Get" or anything else for put). Lines that do
//! not parse are skipped. The raw trace is combined with a [`WorkEstimator`]
//! into a [`ProcessedTrace`], the stream the arrival-model fitting consumes.

pub mod estimator;

use std::path::Path;

use anyhow::{Context, Result};

pub use estimator::WorkEstimator;

/// One raw request from a trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// Arrival time in nanoseconds.
    pub arrival_ns: u64,
    /// Request size in bytes.
    pub request_size: u32,
    /// True for get requests, false for put requests.
    pub is_get: bool,
}

/// One request with its size already translated into work units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessedTraceEntry {
    /// Arrival time in nanoseconds.
    pub arrival_ns: u64,
    /// Work generated by the request, as defined by the estimator.
    pub work: f64,
    /// True for get requests, false for put requests.
    pub is_get: bool,
}

/// In-memory, restartable reader over a request trace.
#[derive(Debug, Clone, Default)]
pub struct TraceReader {
    entries: Vec<TraceEntry>,
    cursor: usize,
}

impl TraceReader {
    /// Read a trace file into memory, skipping lines that do not parse.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading trace file {}", path.display()))?;
        Ok(Self::from_text(&data))
    }

    /// Parse trace lines from text, skipping lines that do not parse.
    pub fn from_text(text: &str) -> Self {
        let entries = text.lines().filter_map(parse_line).collect();
        Self { entries, cursor: 0 }
    }

    /// Number of entries in the trace.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the trace has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Yield the next entry, or None at end of trace.
    pub fn next_entry(&mut self) -> Option<TraceEntry> {
        let entry = self.entries.get(self.cursor).copied();
        if entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    /// Rewind to the beginning of the trace.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Parse one `<decimal ns>,<hex bytes>,<Get|Put>` line.
fn parse_line(line: &str) -> Option<TraceEntry> {
    let mut fields = line.split(',');
    let arrival_ns = fields.next()?.trim().parse::<u64>().ok()?;
    let request_size = u32::from_str_radix(fields.next()?.trim(), 16).ok()?;
    let kind = fields.next()?.trim();
    if kind.is_empty() {
        return None;
    }
    Some(TraceEntry {
        arrival_ns,
        request_size,
        is_get: kind == "Get",
    })
}

/// Trace stream with request sizes converted to work units.
///
/// Single-consumer and not thread-safe, like the reader it wraps.
#[derive(Debug, Clone)]
pub struct ProcessedTrace {
    reader: TraceReader,
    estimator: WorkEstimator,
}

impl ProcessedTrace {
    /// Combine a trace reader with a work estimator.
    pub fn new(reader: TraceReader, estimator: WorkEstimator) -> Self {
        Self { reader, estimator }
    }

    /// Yield the next processed entry, or None at end of trace.
    pub fn next_entry(&mut self) -> Option<ProcessedTraceEntry> {
        self.reader.next_entry().map(|e| ProcessedTraceEntry {
            arrival_ns: e.arrival_ns,
            work: self.estimator.estimate_work(e.request_size, e.is_get),
            is_get: e.is_get,
        })
    }

    /// Rewind to the beginning of the trace.
    pub fn reset(&mut self) {
        self.reader.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
1000,5dc,Get
2000,400,Put
garbage line
3000,5dc,Get
";

    #[test]
    fn test_parse_line_valid() {
        let entry = parse_line("123,ff,Get").unwrap();
        assert_eq!(entry.arrival_ns, 123);
        assert_eq!(entry.request_size, 255);
        assert!(entry.is_get);
    }

    #[test]
    fn test_parse_line_put_and_unknown_kind() {
        assert!(!parse_line("123,ff,Put").unwrap().is_get);
        // Any non-"Get" third field parses as a put, mirroring the trace format.
        assert!(!parse_line("123,ff,Delete").unwrap().is_get);
    }

    #[test]
    fn test_parse_line_invalid() {
        assert!(parse_line("").is_none());
        assert!(parse_line("123,ff").is_none());
        assert!(parse_line("abc,ff,Get").is_none());
        assert!(parse_line("123,zz,Get").is_none());
    }

    #[test]
    fn test_reader_skips_invalid_lines_and_resets() {
        let mut reader = TraceReader::from_text(TRACE);
        assert_eq!(reader.len(), 3);

        let first = reader.next_entry().unwrap();
        assert_eq!(first.arrival_ns, 1000);
        assert_eq!(first.request_size, 0x5dc);
        assert!(first.is_get);

        assert!(reader.next_entry().is_some());
        assert!(reader.next_entry().is_some());
        assert!(reader.next_entry().is_none());

        reader.reset();
        assert_eq!(reader.next_entry().unwrap().arrival_ns, 1000);
    }

    #[test]
    fn test_processed_trace_applies_estimator() {
        let est = WorkEstimator::NetworkIn {
            non_data_constant: 10.0,
            non_data_factor: 0.0,
            data_constant: 0.0,
            data_factor: 1.0,
        };
        let mut trace = ProcessedTrace::new(TraceReader::from_text(TRACE), est);

        let get = trace.next_entry().unwrap();
        assert_eq!(get.work, 10.0);
        assert!(get.is_get);

        let put = trace.next_entry().unwrap();
        assert_eq!(put.work, f64::from(0x400u32));
        assert!(!put.is_get);

        trace.reset();
        assert_eq!(trace.next_entry().unwrap().arrival_ns, 1000);
    }
}
