use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter, Log, Metadata, Record};
use xlsx_template::{
    analyze_template_with_config, generate_from_template, template_summary, CellRef, CellValue,
    DetectorConfig, GenerateOptions, TemplateSummary,
};

#[derive(Debug, Parser)]
#[command(name = "xlsx-template")]
#[command(about = "Fill the data zone of an XLSX template with rows from a CSV file.")]
struct Cli {
    /// Log progress to stderr (`-v` for info, `-vv` for debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the zones detected in a template.
    Analyze(AnalyzeArgs),
    /// Write a new workbook whose data zone holds the CSV rows.
    Generate(GenerateArgs),
}

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Template workbook.
    template: PathBuf,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// JSON file overriding detection settings (missing keys keep their defaults).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Template workbook.
    template: PathBuf,

    /// CSV file with one record per line, columns in caption order. `-` reads stdin.
    #[arg(long, value_name = "PATH")]
    rows: PathBuf,

    /// Where to write the generated workbook.
    #[arg(long, short, value_name = "PATH")]
    output: PathBuf,

    /// Skip the first CSV line.
    #[arg(long)]
    has_headers: bool,

    /// Rename the template sheet.
    #[arg(long)]
    sheet_name: Option<String>,

    /// Set a single cell outside the data zone, in template coordinates (repeatable).
    ///
    /// Format: `<CELL>=<VALUE>`, e.g. `B2=2024-06-30`. A value starting with `=` is a formula.
    #[arg(long = "set", value_name = "CELL=VALUE")]
    set: Vec<String>,

    /// JSON file overriding detection settings (missing keys keep their defaults).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    // Only fails if a logger is already installed.
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::Analyze(args) => analyze(args),
        Command::Generate(args) => generate(args),
    }
}

fn analyze(args: AnalyzeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let bytes = read_file(&args.template)?;
    let model = analyze_template_with_config(&bytes, &config)
        .with_context(|| format!("analyze {}", args.template.display()))?;
    let summary = template_summary(&model);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = match args.format {
        OutputFormat::Text => write_summary(&mut out, &summary),
        OutputFormat::Json => serde_json::to_writer_pretty(&mut out, &summary)
            .map_err(io::Error::from)
            .and_then(|()| out.write_all(b"\n")),
    };
    match written {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}

fn write_summary(out: &mut impl Write, summary: &TemplateSummary) -> io::Result<()> {
    writeln!(out, "sheet: {} ({} in workbook)", summary.sheet_name, summary.sheet_count)?;
    writeln!(
        out,
        "caption row: {} ({})",
        summary.caption_row,
        summary.column_captions.join(" | ")
    )?;
    writeln!(
        out,
        "data rows: {}..={} ({} records{})",
        summary.data_start_row,
        summary.data_end_row,
        summary.data_row_count,
        if summary.has_categories {
            ", with category rows"
        } else {
            ""
        }
    )?;
    writeln!(out, "header rows: {}", summary.header_row_count)?;
    writeln!(out, "footer rows: {}", summary.footer_row_count)?;
    writeln!(out, "columns: {}", summary.max_columns)?;
    writeln!(out, "merged ranges: {}", summary.merge_count)?;
    Ok(())
}

fn generate(args: GenerateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let bytes = read_file(&args.template)?;
    let model = analyze_template_with_config(&bytes, &config)
        .with_context(|| format!("analyze {}", args.template.display()))?;

    let rows = read_rows(&args.rows, args.has_headers)?;
    let options = GenerateOptions {
        sheet_name: args.sheet_name,
        field_updates: parse_field_updates(&args.set)?,
    };

    let output = generate_from_template(&model, &rows, &options)
        .with_context(|| format!("generate from {}", args.template.display()))?;
    std::fs::write(&args.output, &output)
        .with_context(|| format!("write {}", args.output.display()))?;
    info!(
        "wrote {} rows to {} ({} bytes)",
        rows.len(),
        args.output.display(),
        output.len()
    );
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<DetectorConfig> {
    let Some(path) = path else {
        return Ok(DetectorConfig::default());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

fn read_rows(path: &Path, has_headers: bool) -> Result<Vec<Vec<CellValue>>> {
    let source: Box<dyn Read> = if path.as_os_str() == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(path).with_context(|| format!("open {}", path.display()))?)
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(source);

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read CSV record {}", idx + 1))?;
        rows.push(record.iter().map(CellValue::from_input).collect());
    }
    Ok(rows)
}

fn parse_field_updates(args: &[String]) -> Result<BTreeMap<CellRef, CellValue>> {
    let mut updates = BTreeMap::new();
    for arg in args {
        let Some((cell, value)) = arg.split_once('=') else {
            anyhow::bail!("invalid --set '{arg}' (expected format: <CELL>=<VALUE>)");
        };
        let cell_ref = CellRef::from_a1(cell.trim())
            .map_err(|err| anyhow!("invalid cell '{}' in --set: {err}", cell.trim()))?;
        updates.insert(cell_ref, CellValue::from_input(value));
    }
    Ok(updates)
}
