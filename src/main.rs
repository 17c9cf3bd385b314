//! Purpose: `matriculas` CLI entry point: parse args, run one command, emit JSON on stdout.
//! Role: Binary crate root; a thin wrapper over `matriculas::api`.
//! Invariants: Commands emit JSON on stdout (pretty on a TTY) unless a text format is asked for.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Logs go to stderr so stdout stays machine-readable.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod ingest;
mod serve;

use ingest::{ErrorPolicy, IngestFailure, IngestMode, IngestOutcome};
use matriculas::api::{
    ArtifactPaths, Error, ErrorKind, QueryService, SearchPage, ValidationReport, ValidationStatus,
    default_data_dir, to_exit_code,
};
use matriculas::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

/// Where query commands read from: the published generation of a dataset
/// directory, or an explicit store/index pair.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DatasetTarget {
    Dir(PathBuf),
    Pair(ArtifactPaths),
}

impl DatasetTarget {
    fn label(&self) -> String {
        match self {
            DatasetTarget::Dir(dir) => dir.display().to_string(),
            DatasetTarget::Pair(paths) => paths.store.display().to_string(),
        }
    }

    fn open(&self) -> Result<QueryService, Error> {
        match self {
            DatasetTarget::Dir(dir) => QueryService::open_dataset(dir),
            DatasetTarget::Pair(paths) => QueryService::open(paths),
        }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(clap_error_hint(&err)),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    init_tracing(match cli.command {
        Command::Serve { .. } => "info",
        _ => "warn",
    });

    let dir = cli.dir.unwrap_or_else(default_data_dir);
    let result = dataset_target(dir, cli.bin, cli.index).and_then(|target| {
        command_dispatch::dispatch_command(cli.command, target, color_mode)
    });

    result
        .map_err(add_integrity_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "matriculas",
    version,
    about = "Fixed-layout enrollment record store with a municipality name index",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Build once, then query many times. Queries never modify the dataset.

Mental model:
  - `build` turns clean rows into a store file plus a name index
  - `search` lists one municipality's records, filtered and paginated
  - `diff` compares one municipality's enrollment between two years
"#,
    after_help = r#"EXAMPLES
  $ matriculas build data/clean.csv
  $ matriculas search "sao paulo" --year-from 2019 --sex F
  $ matriculas diff "Porto Alegre" --year-from 2020 --year-to 2021
  $ matriculas serve

LEARN MORE
  $ matriculas <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Dataset directory (default: ./bin_files)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long = "bin",
        global = true,
        value_name = "PATH",
        help = "Query an explicit store file instead of the dataset's current build (requires --index)",
        value_hint = ValueHint::FilePath
    )]
    bin: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Index file built from the --bin store (requires --bin)",
        value_hint = ValueHint::FilePath
    )]
    index: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum InputMode {
    Auto,
    Csv,
    Jsonl,
}

#[derive(Copy, Clone, Debug, PartialEq, ValueEnum)]
enum ErrorPolicyCli {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SearchFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Build the store and name index from clean rows",
        long_about = r#"Read clean long-format rows and publish a new dataset generation.

Input columns: municipio, ibge, latitude, longitude, year, sexo, quantidade.
The store and index are written to a hidden staging directory and become visible
together; readers of the previous build are not disturbed."#,
        after_help = r#"EXAMPLES
  $ matriculas build data/clean.csv
  $ matriculas build rows.jsonl --errors skip
  $ cat rows.jsonl | matriculas build - --in jsonl"#
    )]
    Build {
        #[arg(help = "Input file, or - for stdin", value_hint = ValueHint::FilePath)]
        input: String,
        #[arg(
            long = "in",
            default_value = "auto",
            value_enum,
            help = "Input format: auto|csv|jsonl (auto: by extension, then by first byte)"
        )]
        input_mode: InputMode,
        #[arg(
            long,
            short = 'e',
            default_value = "stop",
            value_enum,
            help = "Bad rows: stop (fail the build) or skip (notice on stderr)"
        )]
        errors: ErrorPolicyCli,
    },
    #[command(
        arg_required_else_help = true,
        about = "Search one municipality's records",
        after_help = r#"EXAMPLES
  $ matriculas search "Porto Alegre"
  $ matriculas search "sao paulo" --year-from 2019 --year-to 2021 --sex F
  $ matriculas search canoas --page 2 --page-size 50 --format text"#
    )]
    Search {
        #[arg(help = "Municipality name (accents and case are ignored)")]
        municipio: String,
        #[arg(long, help = "Only records from this year on (inclusive)")]
        year_from: Option<u16>,
        #[arg(long, help = "Only records up to this year (inclusive)")]
        year_to: Option<u16>,
        #[arg(long, help = "Only records of this sex: M or F")]
        sex: Option<String>,
        #[arg(long, default_value_t = 1, help = "1-based page number")]
        page: u32,
        #[arg(long, default_value_t = matriculas::api::DEFAULT_PAGE_SIZE, help = "Records per page")]
        page_size: u32,
        #[arg(long, default_value = "json", value_enum, help = "Output format: json|text")]
        format: SearchFormat,
    },
    #[command(
        arg_required_else_help = true,
        about = "Compare one municipality's enrollment between two years",
        after_help = r#"EXAMPLES
  $ matriculas diff "Porto Alegre" --year-from 2020 --year-to 2021
  $ matriculas diff pelotas --year-from 2015 --year-to 2020 --sex M"#
    )]
    Diff {
        #[arg(help = "Municipality name (accents and case are ignored)")]
        municipio: String,
        #[arg(long, help = "Base year")]
        year_from: u16,
        #[arg(long, help = "Comparison year")]
        year_to: u16,
        #[arg(long, help = "Only records of this sex: M or F")]
        sex: Option<String>,
    },
    #[command(about = "Show the current dataset's build and size")]
    Info,
    #[command(
        about = "Check that the index and store agree",
        long_about = r#"Scan every indexed offset and every stored record.

Exits 7 when the pair is inconsistent (fingerprint mismatch, out-of-range offsets,
malformed records, keys that do not match their records, unindexed records)."#
    )]
    Verify {
        #[arg(long, help = "Emit the JSON report even on a terminal")]
        json: bool,
    },
    #[command(
        about = "Serve read-only queries over HTTP/JSON",
        after_help = r#"ROUTES
  GET /healthz
  GET /v0/info
  GET /v0/search?municipio=&year_from=&year_to=&sex=&page=&page_size=
  GET /v0/difference?municipio=&year_from=&year_to=&sex=

EXAMPLES
  $ matriculas serve
  $ curl 'http://127.0.0.1:9700/v0/search?municipio=canoas'"#
    )]
    Serve {
        #[arg(long, default_value = "127.0.0.1:9700", help = "Address to listen on")]
        bind: String,
        #[arg(long, help = "Allow binding to a non-loopback address")]
        allow_non_loopback: bool,
        #[arg(
            long,
            default_value_t = serve::DEFAULT_MAX_PAGE_SIZE,
            help = "Largest page_size a request may ask for"
        )]
        max_page_size: u32,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ matriculas completion bash > ~/.local/share/bash-completion/completions/matriculas
  $ matriculas completion zsh > ~/.zsh/completions/_matriculas"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn dataset_target(
    dir: PathBuf,
    bin: Option<PathBuf>,
    index: Option<PathBuf>,
) -> Result<DatasetTarget, Error> {
    match (bin, index) {
        (None, None) => Ok(DatasetTarget::Dir(dir)),
        (Some(store), Some(index)) => Ok(DatasetTarget::Pair(ArtifactPaths::new(store, index))),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("--bin and --index must be given together")
            .with_hint("Pass both, or neither to use the dataset's current build.")),
    }
}

fn parse_bind(bind: &str) -> Result<SocketAddr, Error> {
    bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9700.")
    })
}

fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => err.with_hint("Another build holds the dataset lock. Retry when it finishes."),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_integrity_hint(err: Error) -> Error {
    if !err.kind().is_integrity() || err.hint().is_some() {
        return err;
    }
    err.with_hint("The store and index disagree. Run `matriculas verify`, then rebuild.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })
}

fn emit_json(value: Value) {
    let pretty = io::stdout().is_terminal();
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_search_text(page: &SearchPage) {
    println!("Total records found: {}", page.total);
    println!(
        "Showing page {} (size {}) => {} records",
        page.page,
        page.page_size,
        page.records.len()
    );
    for record in &page.records {
        println!(
            "{} | IBGE {} | Year {} | Sex {} | Qty {}",
            record.municipio,
            record.ibge,
            record.year,
            record.sex.code(),
            record.quantity
        );
    }
}

fn emit_verify_human(report: &ValidationReport) {
    let label = report.store_path.display();
    match report.status {
        ValidationStatus::Ok => {
            println!("{label}: consistent");
            println!(
                "  records:   {} stored, {} keys, {} offsets",
                report.store_records, report.index_keys, report.index_offsets
            );
        }
        ValidationStatus::Corrupt => {
            let detail = report
                .issues
                .first()
                .map(|issue| issue.message.clone())
                .unwrap_or_else(|| "inconsistency detected".to_string());
            println!("{label}: inconsistent");
            println!(
                "  records:   {} stored, {} keys, {} offsets",
                report.store_records, report.index_keys, report.index_offsets
            );
            println!("  issues:    {}", report.issue_count);
            println!("  detail:    {detail}");
            for hint in &report.remediation_hints {
                println!("  hint:      {hint}");
            }
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {}", notice.message);
        return;
    }

    let json = serde_json::to_string(&notice_json(notice)).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Validation => "invalid query",
        ErrorKind::NotFound => "not found",
        ErrorKind::Busy => "resource is busy",
        ErrorKind::Permission => "permission denied",
        ErrorKind::OutOfRange => "offset out of range",
        ErrorKind::MalformedRecord => "malformed record",
        ErrorKind::Mismatch => "store and index do not match",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    if let Some(row) = err.row() {
        inner.insert("row".to_string(), json!(row));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    json!({ "error": Value::Object(inner) })
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    let detail = |label: &str, value: String| {
        format!(
            "{} {value}",
            colorize_label(label, use_color, AnsiColor::Yellow)
        )
    };

    if let Some(hint) = err.hint() {
        lines.push(detail("hint:", hint.to_string()));
    }
    if let Some(path) = err.path() {
        lines.push(detail("path:", path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        lines.push(detail("offset:", offset.to_string()));
    }
    if let Some(row) = err.row() {
        lines.push(detail("row:", row.to_string()));
    }
    if let Some(cause) = error_causes(err).into_iter().next() {
        lines.push(detail("caused by:", cause));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let subcommand = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .and_then(|usage| {
            let mut tokens = usage.split_whitespace();
            tokens.find(|token| *token == "matriculas")?;
            tokens.next().filter(|token| {
                !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('[')
            })
        });
    match subcommand {
        Some(name) => format!("Try `matriculas {name} --help`."),
        None => "Try `matriculas --help`.".to_string(),
    }
}

fn open_input(input: &str) -> Result<Box<dyn Read>, Error> {
    if input == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let file = std::fs::File::open(input).map_err(|err| {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::Io,
        };
        Error::new(kind)
            .with_message("failed to open input")
            .with_path(input)
            .with_hint("Pass a CSV or JSONL file, or - to read stdin.")
            .with_source(err)
    })?;
    Ok(Box::new(file))
}

fn input_mode_to_ingest(mode: InputMode, input: &str) -> IngestMode {
    let mode = match mode {
        InputMode::Auto => IngestMode::Auto,
        InputMode::Csv => IngestMode::Csv,
        InputMode::Jsonl => IngestMode::Jsonl,
    };
    mode.for_path(Path::new(input))
}

fn error_policy_to_ingest(policy: ErrorPolicyCli) -> ErrorPolicy {
    match policy {
        ErrorPolicyCli::Stop => ErrorPolicy::Stop,
        ErrorPolicyCli::Skip => ErrorPolicy::Skip,
    }
}

fn ingest_failure_notice(failure: &IngestFailure, dataset: &str, color_mode: ColorMode) {
    tracing::warn!(row = failure.row, error = %failure.message, "skipped row");
    let mut details = Map::new();
    details.insert("mode".to_string(), json!(failure.mode.label()));
    details.insert("row".to_string(), json!(failure.row));
    if let Some(snippet) = &failure.snippet {
        details.insert("snippet".to_string(), json!(snippet));
    }
    let notice = Notice {
        kind: "ingest_skip".to_string(),
        time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
        cmd: "build".to_string(),
        dataset: dataset.to_string(),
        message: format!("Skipped row {}: {}.", failure.row, failure.message),
        details,
    };
    emit_notice(&notice, color_mode);
}

fn ingest_summary_notice(outcome: &IngestOutcome, dataset: &str, color_mode: ColorMode) {
    let mut details = Map::new();
    details.insert("total".to_string(), json!(outcome.rows_total));
    details.insert("ok".to_string(), json!(outcome.ok));
    details.insert("failed".to_string(), json!(outcome.failed));
    let notice = Notice {
        kind: "ingest_summary".to_string(),
        time: notice_time_now().unwrap_or_else(|| "unknown".to_string()),
        cmd: "build".to_string(),
        dataset: dataset.to_string(),
        message: format!(
            "Finished with {} skipped row{}.",
            outcome.failed,
            if outcome.failed == 1 { "" } else { "s" }
        ),
        details,
    };
    emit_notice(&notice, color_mode);
}
