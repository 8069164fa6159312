//! Output formatters for probe reports.
//!
//! This module provides trait-based formatters for rendering reports in
//! various output formats (human-readable, JSON, compact).

use crate::analysis::{self, HashKind};
use crate::memory_map::MemoryMap;
use crate::scanner::MatchRecord;
use crate::types::FileType;
use serde::Serialize;

/// File identification and layout.
#[derive(Debug, Clone, Serialize)]
pub struct InfoReport {
    /// Input path.
    pub file: String,
    /// File size in bytes.
    pub size: u64,
    /// Every detected type.
    pub file_types: Vec<FileType>,
    /// Preferred type.
    pub preferred: FileType,
    /// Memory map of the preferred type.
    pub map: MemoryMap,
    /// Whole-file entropy, `None` if cancelled.
    pub entropy: Option<f64>,
}

/// String or signature matches.
#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    /// Input path.
    pub file: String,
    /// Matches in offset order.
    pub matches: Vec<MatchRecord>,
    /// Whether the scan stopped early.
    pub cancelled: bool,
}

/// One digest.
#[derive(Debug, Clone, Serialize)]
pub struct HashReport {
    /// Input path.
    pub file: String,
    /// Algorithm.
    pub kind: HashKind,
    /// Lower-case hex digest, `None` if cancelled.
    pub digest: Option<String>,
}

/// Entropy of a range.
#[derive(Debug, Clone, Serialize)]
pub struct EntropyReport {
    /// Input path.
    pub file: String,
    /// Range start.
    pub offset: u64,
    /// Range length actually read.
    pub size: u64,
    /// Bits per byte, `None` if cancelled.
    pub entropy: Option<f64>,
}

impl EntropyReport {
    /// Whether the entropy suggests packed or encrypted data.
    pub fn packed(&self) -> Option<bool> {
        self.entropy.map(analysis::is_packed)
    }
}

/// Trait for formatting reports.
pub trait ReportFormatter {
    /// Format an info report.
    fn format_info(&self, report: &InfoReport) -> String;

    /// Format a match report.
    fn format_matches(&self, report: &MatchReport) -> String;

    /// Format a digest.
    fn format_hash(&self, report: &HashReport) -> String;

    /// Format an entropy report.
    fn format_entropy(&self, report: &EntropyReport) -> String;
}

/// Human-readable output formatter.
#[derive(Debug, Clone, Default)]
pub struct HumanFormatter {
    /// Show verbose output (record indices, load sections)
    pub verbose: bool,
    /// Quiet mode (minimal output)
    pub quiet: bool,
}

impl HumanFormatter {
    /// Create a new human formatter with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a verbose formatter.
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            quiet: false,
        }
    }

    /// Create a quiet formatter.
    pub fn quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
        }
    }
}

fn cancelled_note(cancelled: bool) -> &'static str {
    if cancelled {
        "  (cancelled, results are partial)\n"
    } else {
        ""
    }
}

impl ReportFormatter for HumanFormatter {
    fn format_info(&self, report: &InfoReport) -> String {
        if self.quiet {
            return format!("{}: {}\n", report.file, report.preferred);
        }
        let map = &report.map;
        let types: Vec<&str> = report.file_types.iter().map(|t| t.name()).collect();
        let mut s = format!("File: {}\n", report.file);
        s.push_str(&format!("  Size:       {} bytes\n", report.size));
        s.push_str(&format!("  Type:       {}\n", report.preferred));
        s.push_str(&format!("  Detected:   {}\n", types.join(", ")));
        if !map.arch.is_empty() {
            s.push_str(&format!("  Arch:       {}\n", map.arch));
        }
        s.push_str(&format!("  Mode:       {} {}\n", map.mode, map.endianness));
        s.push_str(&format!("  Base:       0x{:X}\n", map.module_address));
        s.push_str(&format!("  Image size: 0x{:X}\n", map.image_size));
        if let Some(entry) = map.entry_point_address {
            s.push_str(&format!("  Entry:      0x{entry:X}\n"));
        }
        if let Some(overlay) = map.overlay() {
            s.push_str(&format!("  Overlay:    {} bytes\n", overlay.size));
        }
        if let Some(e) = report.entropy {
            let packed = if analysis::is_packed(e) { " (packed?)" } else { "" };
            s.push_str(&format!("  Entropy:    {e:.4}{packed}\n"));
        }
        s.push_str("  Records:\n");
        for record in map.records() {
            if self.verbose {
                let section = record
                    .load_section
                    .map_or_else(|| "-".to_string(), |n| n.to_string());
                s.push_str(&format!("    [{:>3}] {record} (section {section})\n", record.index));
            } else {
                s.push_str(&format!("    {record}\n"));
            }
        }
        s
    }

    fn format_matches(&self, report: &MatchReport) -> String {
        let mut s = String::new();
        if !self.quiet {
            s.push_str(&format!("File: {}\n", report.file));
        }
        for m in &report.matches {
            if self.quiet {
                s.push_str(&format!("{}\n", m.text));
                continue;
            }
            let text = if m.text.is_empty() { &m.info } else { &m.text };
            s.push_str(&format!("  0x{:08X} {:>5} {:<2} {}\n", m.offset, m.size, m.kind, text));
        }
        if !self.quiet {
            s.push_str(&format!("  {} matches\n", report.matches.len()));
            s.push_str(cancelled_note(report.cancelled));
        }
        s
    }

    fn format_hash(&self, report: &HashReport) -> String {
        match &report.digest {
            Some(digest) if self.quiet => format!("{digest}\n"),
            Some(digest) => format!("{} ({}) = {digest}\n", report.kind, report.file),
            None => format!("{} ({}): cancelled\n", report.kind, report.file),
        }
    }

    fn format_entropy(&self, report: &EntropyReport) -> String {
        let Some(e) = report.entropy else {
            return format!("{}: cancelled\n", report.file);
        };
        if self.quiet {
            return format!("{e:.4}\n");
        }
        let verdict = if report.packed() == Some(true) {
            "packed"
        } else {
            "not packed"
        };
        format!(
            "File: {}\n  Range:      0x{:X} +0x{:X}\n  Entropy:    {e:.4} ({verdict})\n",
            report.file, report.offset, report.size
        )
    }
}

/// JSON output formatter.
#[derive(Debug, Clone)]
pub struct JsonFormatter {
    /// Pretty-print JSON
    pub pretty: bool,
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self { pretty: true }
    }
}

impl JsonFormatter {
    /// Create a new JSON formatter with pretty printing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compact JSON formatter.
    pub fn compact() -> Self {
        Self { pretty: false }
    }

    fn render<T: Serialize>(&self, value: &T) -> String {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        let mut s = json.unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

impl ReportFormatter for JsonFormatter {
    fn format_info(&self, report: &InfoReport) -> String {
        self.render(report)
    }

    fn format_matches(&self, report: &MatchReport) -> String {
        self.render(report)
    }

    fn format_hash(&self, report: &HashReport) -> String {
        self.render(report)
    }

    fn format_entropy(&self, report: &EntropyReport) -> String {
        #[derive(Serialize)]
        struct Output<'a> {
            #[serde(flatten)]
            report: &'a EntropyReport,
            packed: Option<bool>,
        }
        self.render(&Output {
            report,
            packed: report.packed(),
        })
    }
}

/// Compact single-line output formatter.
#[derive(Debug, Clone, Default)]
pub struct ShortFormatter;

impl ShortFormatter {
    /// Create a new short formatter.
    pub fn new() -> Self {
        Self
    }
}

impl ReportFormatter for ShortFormatter {
    fn format_info(&self, report: &InfoReport) -> String {
        let entropy = report
            .entropy
            .map_or_else(|| "-".to_string(), |e| format!("{e:.2}"));
        format!(
            "{}\t{}\t{}\t{}\t{}\n",
            report.file,
            report.preferred,
            if report.map.arch.is_empty() {
                "-"
            } else {
                report.map.arch.as_str()
            },
            report.map.records().len(),
            entropy
        )
    }

    fn format_matches(&self, report: &MatchReport) -> String {
        report
            .matches
            .iter()
            .map(|m| format!("{}\t{:#x}\t{}\t{}\n", report.file, m.offset, m.kind, m.text))
            .collect()
    }

    fn format_hash(&self, report: &HashReport) -> String {
        format!(
            "{}\t{}\t{}\n",
            report.file,
            report.kind,
            report.digest.as_deref().unwrap_or("-")
        )
    }

    fn format_entropy(&self, report: &EntropyReport) -> String {
        let entropy = report
            .entropy
            .map_or_else(|| "-".to_string(), |e| format!("{e:.4}"));
        format!("{}\t{entropy}\n", report.file)
    }
}
