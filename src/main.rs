//! schedtrace: convert raw ftrace scheduling traces into an event-set file.
//!
//! Reads the ftrace format description files, a directory of per-CPU
//! ring-buffer dumps, and optionally the per-CPU stats files, then writes
//! the serialized event set that `sched::Collection` consumes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use schedtrace::events::CpuId;
use schedtrace::ringbuf::DecodeError;
use schedtrace::{cpu_overflowed, Endianness, EventSetBuilder, TraceParser};

#[derive(Debug, Parser)]
#[command(name = "schedtrace")]
#[command(about = "Convert raw ftrace scheduling traces into an event-set file")]
#[command(version)]
struct Cli {
    /// Comma separated list of format file paths. Must include the
    /// header_page format file.
    #[arg(long, value_delimiter = ',', required = true)]
    format_files: Vec<PathBuf>,

    /// Directory containing per-CPU trace files (cpu0, cpu1, ...).
    #[arg(long)]
    trace_files: PathBuf,

    /// Path to write the serialized event set to.
    #[arg(long)]
    output_path: PathBuf,

    /// Optional directory of per-CPU stats files; CPUs reporting lost
    /// events are marked clipped.
    #[arg(long)]
    stats_files: Option<PathBuf>,

    /// Output encoding.
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    output_format: OutputFormat,

    /// Fail when a record's event id has no format file.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_on_unknown_event_format: bool,

    /// Decode integer fields big-endian (captures from big-endian hosts).
    #[arg(long)]
    big_endian: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    JsonPretty,
}

/// List `cpu<N>` files in a directory, ordered by CPU number.
fn cpu_files(dir: &Path) -> Result<Vec<(CpuId, PathBuf)>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(cpu) = name
            .strip_prefix("cpu")
            .and_then(|n| n.parse::<CpuId>().ok())
        {
            files.push((cpu, entry.path()));
        }
    }
    files.sort_by_key(|(cpu, _)| *cpu);
    if files.is_empty() {
        bail!("no cpu files found in {}", dir.display());
    }
    Ok(files)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let mut header_text = None;
    let mut format_texts = Vec::new();
    for path in &cli.format_files {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading format file {}", path.display()))?;
        if path.ends_with("header_page") {
            header_text = Some(text);
        } else {
            format_texts.push(text);
        }
    }
    let header_text = match header_text {
        Some(text) => text,
        None => bail!("--format-files must include a path ending in header_page"),
    };

    let mut parser = TraceParser::new(&header_text, format_texts.iter().map(String::as_str))?;
    parser.set_fail_on_unknown_event_format(cli.fail_on_unknown_event_format);
    if cli.big_endian {
        parser.set_endianness(Endianness::Big);
    }

    let mut builder = EventSetBuilder::new(parser.formats());

    if let Some(stats_dir) = &cli.stats_files {
        let mut clipped = Vec::new();
        for (cpu, path) in cpu_files(stats_dir)? {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading stats file {}", path.display()))?;
            if cpu_overflowed(&text)
                .with_context(|| format!("parsing stats file {}", path.display()))?
            {
                tracing::info!(cpu, "stats report lost events, marking cpu clipped");
                clipped.push(cpu);
            }
        }
        builder.set_clipped_cpus(clipped);
    }

    for (cpu, path) in cpu_files(&cli.trace_files)? {
        let data =
            fs::read(&path).with_context(|| format!("reading trace file {}", path.display()))?;
        let result = parser.parse_trace(&data, cpu, |event| {
            builder.add_trace_event(&event)?;
            Ok(true)
        });
        if let Err(err) = result {
            // A truncated page kills only that CPU's stream; everything
            // decoded before it stays in the set.
            if matches!(
                err.downcast_ref::<DecodeError>(),
                Some(DecodeError::TruncatedPage { .. })
            ) {
                tracing::warn!(cpu, error = %err, "cpu stream truncated, keeping earlier events");
            } else {
                return Err(err);
            }
        }
    }

    let set = builder.finalize();
    tracing::info!(
        events = set.event_count(),
        output = %cli.output_path.display(),
        "writing event set"
    );
    let bytes = match cli.output_format {
        OutputFormat::Json => serde_json::to_vec(&set)?,
        OutputFormat::JsonPretty => serde_json::to_vec_pretty(&set)?,
    };
    fs::write(&cli.output_path, bytes)
        .with_context(|| format!("writing output file {}", cli.output_path.display()))?;
    Ok(())
}
