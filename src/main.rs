//! binprobe CLI
//!
//! Command-line tool for identifying binary formats, listing memory maps,
//! extracting strings, searching signatures and computing digests.

use anyhow::{Context, Result};
use binprobe::analysis::{self, HashKind};
use binprobe::formatter::{
    EntropyReport, HashReport, HumanFormatter, InfoReport, JsonFormatter, MatchReport,
    ReportFormatter, ShortFormatter,
};
use binprobe::scanner::CodePage;
use binprobe::{
    scan_signature, Device, Encodings, FormatRegistry, ProgressToken, SignatureSet,
    StringScanOptions, StringScanner,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Format-agnostic binary introspection.
///
/// Detects ELF, PE, Mach-O, MS-DOS, Amiga Hunk and other formats, prints
/// their memory maps, and scans for strings and byte signatures.
#[derive(Parser, Debug)]
#[command(name = "binprobe")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output format
    #[arg(short, long, global = true, default_value = "human")]
    format: OutputFormat,

    /// Verbose output and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (only output essential info)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Stop long operations after this many seconds
    #[arg(long, global = true, env = "BINPROBE_TIMEOUT")]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detected types, memory map and entropy
    Info {
        /// Input file
        file: PathBuf,
        /// Include images, archives and text in detection
        #[arg(long)]
        extra: bool,
    },
    /// Extract strings
    Strings {
        /// Input file
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
        /// Minimum string length
        #[arg(long, default_value = "5")]
        min: usize,
        /// Maximum string length
        #[arg(long, default_value = "1024")]
        max: usize,
        /// Single-byte strings
        #[arg(long)]
        ansi: bool,
        /// UTF-8 strings with multi-byte characters
        #[arg(long)]
        utf8: bool,
        /// UTF-16LE strings
        #[arg(long)]
        unicode: bool,
        /// Only NUL-terminated strings
        #[arg(long)]
        c_strings: bool,
        /// Keep strings matching this regular expression
        #[arg(long)]
        filter: Option<String>,
        /// Keep only strings containing a URL
        #[arg(long)]
        links: bool,
        /// Treat bytes 0xA0-0xFF as printable single-byte characters
        #[arg(long)]
        latin1: bool,
        /// Stop after this many matches (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
    },
    /// Search for a byte signature
    Search {
        /// Input file
        file: PathBuf,
        /// Signature text, e.g. "E8 $$$$ .. 'MZ'"
        signature: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Label attached to every match
        #[arg(long, default_value = "")]
        info: String,
        /// Stop after this many matches (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
    },
    /// Digest of the file
    Hash {
        /// Input file
        file: PathBuf,
        /// Digest algorithm
        #[arg(short, long, default_value = "sha256")]
        kind: HashKind,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Shannon entropy of a range
    Entropy {
        /// Input file
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
}

/// Byte range selection.
#[derive(clap::Args, Debug, Clone, Copy)]
struct RangeArgs {
    /// Start offset (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "0", value_parser = parse_number)]
    offset: u64,
    /// Range size; the rest of the file when omitted
    #[arg(long, value_parser = parse_number)]
    size: Option<u64>,
}

/// Output format options.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
    /// Compact single-line output
    Short,
}

fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("binprobe=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let formatter: Box<dyn ReportFormatter> = match args.format {
        OutputFormat::Human if args.quiet => Box::new(HumanFormatter::quiet()),
        OutputFormat::Human if args.verbose => Box::new(HumanFormatter::verbose()),
        OutputFormat::Human => Box::new(HumanFormatter::new()),
        OutputFormat::Json => Box::new(JsonFormatter::new()),
        OutputFormat::Short => Box::new(ShortFormatter::new()),
    };

    let token = Arc::new(ProgressToken::new());
    if let Some(seconds) = args.timeout {
        spawn_watchdog(Arc::clone(&token), Duration::from_secs(seconds));
    }

    match run(&args.command, formatter.as_ref(), &token) {
        Ok(output) => {
            print!("{output}");
            if token.is_stopped() {
                eprintln!("Stopped after {}s timeout", args.timeout.unwrap_or(0));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if !args.quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

/// Wall-clock limits live outside the engine: a thread that trips the
/// shared stop flag.
fn spawn_watchdog(token: Arc<ProgressToken>, limit: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(limit);
        tracing::debug!(?limit, "timeout reached, stopping");
        token.stop();
    });
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("cannot open {}", path.display()))
}

fn run(command: &Command, formatter: &dyn ReportFormatter, token: &ProgressToken) -> Result<String> {
    match command {
        Command::Info { file, extra } => {
            let mut source = open(file)?;
            let mut device = Device::new(&mut source);
            let registry = FormatRegistry::default();
            let types = registry.detect_types(&mut device, *extra);
            let preferred = binprobe::formats::preferred_of(&types);
            let map = registry.memory_map(&mut device);
            let entropy = analysis::entropy(&mut device, 0, None, Some(token));
            Ok(formatter.format_info(&InfoReport {
                file: file.display().to_string(),
                size: device.size(),
                file_types: types.into_iter().collect(),
                preferred,
                map,
                entropy,
            }))
        }
        Command::Strings {
            file,
            range,
            min,
            max,
            ansi,
            utf8,
            unicode,
            c_strings,
            filter,
            links,
            latin1,
            limit,
        } => {
            let mut encodings = Encodings::empty();
            encodings.set(Encodings::ANSI, *ansi);
            encodings.set(Encodings::UTF8, *utf8);
            encodings.set(Encodings::UNICODE, *unicode);
            let mut options = StringScanOptions::new()
                .with_lengths(*min, *max)
                .with_c_strings_only(*c_strings)
                .with_links_only(*links)
                .with_limit(*limit);
            if !encodings.is_empty() {
                options = options.with_encodings(encodings);
            }
            if *latin1 {
                options = options.with_code_page(CodePage::Latin1);
            }
            if let Some(pattern) = filter {
                options = options
                    .with_regex_filter(pattern)
                    .with_context(|| format!("bad --filter '{pattern}'"))?;
            }

            let mut source = open(file)?;
            let mut device = Device::new(&mut source);
            let scanner = StringScanner::new(options);
            let mut search = scanner.scan(&mut device, range.offset, range.size, Some(token));
            let matches: Vec<_> = search.by_ref().collect();
            let cancelled = search.is_cancelled();
            Ok(formatter.format_matches(&MatchReport {
                file: file.display().to_string(),
                matches,
                cancelled,
            }))
        }
        Command::Search {
            file,
            signature,
            range,
            info,
            limit,
        } => {
            let signature = SignatureSet::compile(signature)
                .with_context(|| format!("bad signature '{signature}'"))?;
            let mut source = open(file)?;
            let mut device = Device::new(&mut source);
            let map = FormatRegistry::default().memory_map(&mut device);
            let matches = scan_signature(
                &mut device,
                &map,
                &signature,
                range.offset,
                range.size,
                info,
                *limit,
                Some(token),
            );
            Ok(formatter.format_matches(&MatchReport {
                file: file.display().to_string(),
                matches,
                cancelled: token.is_stopped(),
            }))
        }
        Command::Hash { file, kind, range } => {
            let mut source = open(file)?;
            let mut device = Device::new(&mut source);
            let digest = analysis::hash(&mut device, *kind, range.offset, range.size, Some(token));
            Ok(formatter.format_hash(&HashReport {
                file: file.display().to_string(),
                kind: *kind,
                digest,
            }))
        }
        Command::Entropy { file, range } => {
            let mut source = open(file)?;
            let mut device = Device::new(&mut source);
            let (offset, size) = device.clamp_range(range.offset, range.size);
            let entropy = analysis::entropy(&mut device, offset, Some(size), Some(token));
            Ok(formatter.format_entropy(&EntropyReport {
                file: file.display().to_string(),
                offset,
                size,
                entropy,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_parsing() {
        let args = Args::try_parse_from(["binprobe", "info", "test.bin"]).unwrap();
        assert!(matches!(args.command, Command::Info { extra: false, .. }));
        assert!(!args.verbose);
    }

    #[test]
    fn test_global_format_after_subcommand() {
        let args = Args::try_parse_from(["binprobe", "hash", "a.bin", "-f", "json"]).unwrap();
        assert!(matches!(args.format, OutputFormat::Json));
        assert!(matches!(
            args.command,
            Command::Hash {
                kind: HashKind::Sha256,
                ..
            }
        ));
    }

    #[test]
    fn test_range_numbers() {
        let args = Args::try_parse_from([
            "binprobe", "entropy", "a.bin", "--offset", "0x200", "--size", "512",
        ])
        .unwrap();
        match args.command {
            Command::Entropy { range, .. } => {
                assert_eq!(range.offset, 0x200);
                assert_eq!(range.size, Some(512));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(parse_number("0xZZ").is_err());
    }

    #[test]
    fn test_strings_help_matches_behavior() {
        use binprobe::scanner::is_link;
        use clap::CommandFactory;

        let command = Args::command();
        let strings = command.find_subcommand("strings").unwrap();
        let help = |id: &str| {
            strings
                .get_arguments()
                .find(|a| a.get_id() == id)
                .and_then(|a| a.get_help())
                .map(ToString::to_string)
                .unwrap()
        };
        assert!(help("latin1").contains("0xA0-0xFF"));
        assert!(CodePage::Latin1.is_printable(0xA0));
        assert!(!CodePage::Latin1.is_printable(0x9F));
        assert!(help("links").contains("URL"));
        assert!(is_link("http://example.com"));
        assert!(!is_link("/usr/lib/libc.so.6"));
    }

    #[test]
    fn test_run_strings_on_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\x01hello world\x00\x02").unwrap();
        file.flush().unwrap();

        let command = Command::Strings {
            file: file.path().to_path_buf(),
            range: RangeArgs {
                offset: 0,
                size: None,
            },
            min: 5,
            max: 1024,
            ansi: true,
            utf8: false,
            unicode: false,
            c_strings: false,
            filter: None,
            links: false,
            latin1: false,
            limit: 0,
        };
        let token = ProgressToken::new();
        let out = run(&command, &ShortFormatter::new(), &token).unwrap();
        assert!(out.ends_with("\t0x2\tA\thello world\n"), "{out}");
    }
}
