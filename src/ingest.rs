//! Purpose: Read clean long-format enrollment rows (CSV or JSON Lines) into records.
//! Exports: `IngestMode`, `ErrorPolicy`, `IngestConfig`, `IngestOutcome`, `IngestFailure`, `ingest`.
//! Role: Input ingestion for `matriculas build`; isolates row parsing from the build pass.
//! Invariants: Auto detection is deterministic: file extension first, then the first byte.
//! Invariants: Skip mode only continues at row boundaries; stop mode fails on the first bad row.
//! Invariants: Rows are streamed; nothing beyond one row is buffered.
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use matriculas::api::{Error, ErrorKind, Record, Sex};
use serde::Deserialize;

const REQUIRED_COLUMNS: [&str; 2] = ["municipio", "year"];
const MAX_SNIPPET_BYTES: usize = 200;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IngestMode {
    Auto,
    Csv,
    Jsonl,
}

impl IngestMode {
    /// Resolves `Auto` from a file extension; unknown extensions stay `Auto` and are sniffed.
    pub fn for_path(self, path: &Path) -> IngestMode {
        if self != IngestMode::Auto {
            return self;
        }
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => IngestMode::Csv,
            Some("jsonl" | "ndjson" | "json") => IngestMode::Jsonl,
            _ => IngestMode::Auto,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            IngestMode::Auto => "auto",
            IngestMode::Csv => "csv",
            IngestMode::Jsonl => "jsonl",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorPolicy {
    Stop,
    Skip,
}

#[derive(Copy, Clone, Debug)]
pub struct IngestConfig {
    pub mode: IngestMode,
    pub errors: ErrorPolicy,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct IngestOutcome {
    pub rows_total: u64,
    pub ok: u64,
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct IngestFailure {
    /// 1-based data row (CSV) or line (JSONL) number.
    pub row: u64,
    pub mode: IngestMode,
    pub message: String,
    pub snippet: Option<String>,
}

/// A cell that may arrive as a number (JSON, or a numeric CSV field) or as text.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Cell {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct Row {
    municipio: String,
    #[serde(default)]
    ibge: Option<Cell>,
    #[serde(default)]
    latitude: Option<Cell>,
    #[serde(default)]
    longitude: Option<Cell>,
    #[serde(default)]
    year: Option<Cell>,
    #[serde(default)]
    sexo: Option<Cell>,
    #[serde(default)]
    quantidade: Option<Cell>,
}

pub fn ingest<R, F, N>(
    reader: R,
    config: IngestConfig,
    mut on_record: F,
    mut on_failure: N,
) -> Result<IngestOutcome, Error>
where
    R: Read,
    F: FnMut(Record) -> Result<(), Error>,
    N: FnMut(IngestFailure),
{
    let mut reader = BufReader::new(reader);
    let mode = match config.mode {
        IngestMode::Auto => sniff_mode(&mut reader)?,
        mode => mode,
    };

    let mut outcome = IngestOutcome::default();
    let mut accept = |row: u64,
                      parsed: Result<Record, String>,
                      snippet: Option<String>|
     -> Result<(), Error> {
        outcome.rows_total += 1;
        match parsed {
            Ok(record) => {
                on_record(record)?;
                outcome.ok += 1;
                Ok(())
            }
            Err(message) => match config.errors {
                ErrorPolicy::Stop => Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid {} row: {message}", mode.label()))
                    .with_row(row)
                    .with_hint("Fix the row, or use --errors skip to continue past bad rows.")),
                ErrorPolicy::Skip => {
                    outcome.failed += 1;
                    on_failure(IngestFailure {
                        row,
                        mode,
                        message,
                        snippet,
                    });
                    Ok(())
                }
            },
        }
    };

    match mode {
        IngestMode::Csv | IngestMode::Auto => ingest_csv(reader, &mut accept)?,
        IngestMode::Jsonl => ingest_jsonl(reader, &mut accept)?,
    }
    Ok(outcome)
}

fn sniff_mode<R: Read>(reader: &mut BufReader<R>) -> Result<IngestMode, Error> {
    let prefix = reader.fill_buf().map_err(read_error)?;
    let first = prefix.iter().find(|byte| !byte.is_ascii_whitespace());
    Ok(match first {
        Some(b'{') => IngestMode::Jsonl,
        _ => IngestMode::Csv,
    })
}

fn ingest_csv<R, A>(reader: R, accept: &mut A) -> Result<(), Error>
where
    R: Read,
    A: FnMut(u64, Result<Record, String>, Option<String>) -> Result<(), Error>,
{
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(reader);
    let headers = csv.headers().map_err(csv_fatal)?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|header| header == *column))
        .collect();
    if !missing.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("csv header is missing {}", missing.join(", ")))
            .with_hint(
                "Expected columns: municipio, ibge, latitude, longitude, year, sexo, quantidade.",
            ));
    }

    for (index, result) in csv.deserialize::<Row>().enumerate() {
        let row = index as u64 + 1;
        let parsed = match result {
            Ok(raw) => row_to_record(raw),
            Err(err) if err.is_io_error() => return Err(csv_fatal(err)),
            Err(err) => Err(err.to_string()),
        };
        accept(row, parsed, None)?;
    }
    Ok(())
}

fn ingest_jsonl<R, A>(reader: BufReader<R>, accept: &mut A) -> Result<(), Error>
where
    R: Read,
    A: FnMut(u64, Result<Record, String>, Option<String>) -> Result<(), Error>,
{
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(read_error)?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Row>(trimmed)
            .map_err(|err| err.to_string())
            .and_then(row_to_record);
        let snippet = parsed.is_err().then(|| truncate_snippet(trimmed));
        accept(index as u64 + 1, parsed, snippet)?;
    }
    Ok(())
}

fn row_to_record(row: Row) -> Result<Record, String> {
    let municipio = row.municipio.trim().to_string();
    if municipio.is_empty() {
        return Err("municipio is empty".to_string());
    }
    Ok(Record {
        ibge: parse_ibge(row.ibge.as_ref())?,
        year: parse_year(row.year.as_ref())?,
        sex: parse_sex(row.sexo.as_ref())?,
        quantity: parse_quantity(row.quantidade.as_ref())?,
        municipio,
        latitude: parse_coordinate(row.latitude.as_ref()),
        longitude: parse_coordinate(row.longitude.as_ref()),
    })
}

fn parse_ibge(cell: Option<&Cell>) -> Result<u32, String> {
    match cell {
        None => Ok(0),
        Some(Cell::Text(text)) if text.trim().is_empty() => Ok(0),
        Some(Cell::Text(text)) => text
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("ibge {text:?} is not a municipality code")),
        Some(Cell::Number(value)) => whole_number(*value, u32::MAX.into())
            .map(|value| value as u32)
            .ok_or_else(|| format!("ibge {value} is not a municipality code")),
    }
}

fn parse_year(cell: Option<&Cell>) -> Result<u16, String> {
    match cell {
        None => Err("year is required".to_string()),
        Some(Cell::Text(text)) if text.trim().is_empty() => Err("year is required".to_string()),
        Some(Cell::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("year {text:?} is not a valid year")),
        Some(Cell::Number(value)) => whole_number(*value, u16::MAX.into())
            .map(|value| value as u16)
            .ok_or_else(|| format!("year {value} is not a valid year")),
    }
}

fn parse_sex(cell: Option<&Cell>) -> Result<Sex, String> {
    let text = match cell {
        None => return Ok(Sex::Blank),
        Some(Cell::Text(text)) => text.trim(),
        Some(Cell::Number(value)) => return Err(format!("sexo {value} is not M or F")),
    };
    match text.chars().next().map(|c| c.to_ascii_uppercase()) {
        None => Ok(Sex::Blank),
        Some('M') => Ok(Sex::Male),
        Some('F') => Ok(Sex::Female),
        Some(_) => Err(format!("sexo {text:?} is not M or F")),
    }
}

fn parse_quantity(cell: Option<&Cell>) -> Result<f64, String> {
    let value = match cell {
        None => return Ok(0.0),
        Some(Cell::Text(text)) if text.trim().is_empty() => return Ok(0.0),
        Some(Cell::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("quantidade {text:?} is not a number"))?,
        Some(Cell::Number(value)) => *value,
    };
    if !value.is_finite() || value < 0.0 {
        return Err(format!("quantidade {value} must be a non-negative number"));
    }
    Ok(value)
}

fn parse_coordinate(cell: Option<&Cell>) -> f64 {
    let value = match cell {
        Some(Cell::Number(value)) => *value,
        Some(Cell::Text(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        None => 0.0,
    };
    if value.is_finite() { value } else { 0.0 }
}

fn whole_number(value: f64, max: f64) -> Option<f64> {
    (value.fract() == 0.0 && (0.0..=max).contains(&value)).then_some(value)
}

fn truncate_snippet(input: &str) -> String {
    if input.len() <= MAX_SNIPPET_BYTES {
        return input.to_string();
    }
    let mut end = MAX_SNIPPET_BYTES;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn read_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read input")
        .with_source(err)
}

fn csv_fatal(err: csv::Error) -> Error {
    let kind = if err.is_io_error() {
        ErrorKind::Io
    } else {
        ErrorKind::Usage
    };
    Error::new(kind)
        .with_message("failed to read csv input")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{ErrorPolicy, IngestConfig, IngestFailure, IngestMode, IngestOutcome, ingest};
    use matriculas::api::{Error, ErrorKind, Record, Sex};
    use std::path::Path;

    const HEADER: &str = "municipio,ibge,latitude,longitude,year,sexo,quantidade\n";

    fn run(
        input: &str,
        mode: IngestMode,
        errors: ErrorPolicy,
    ) -> (Result<IngestOutcome, Error>, Vec<Record>, Vec<IngestFailure>) {
        let mut records = Vec::new();
        let mut failures = Vec::new();
        let result = ingest(
            input.as_bytes(),
            IngestConfig { mode, errors },
            |record| {
                records.push(record);
                Ok(())
            },
            |failure| failures.push(failure),
        );
        (result, records, failures)
    }

    #[test]
    fn csv_rows_map_to_records() {
        let input = format!(
            "{HEADER}Porto Alegre,4314902,-30.03,-51.22,2021,masculino,120\n\
             Ijuí,,-28.38,-53.91,2020,,\n"
        );
        let (result, records, failures) = run(&input, IngestMode::Csv, ErrorPolicy::Stop);
        let outcome = result.expect("ingest");
        assert_eq!(outcome.ok, 2);
        assert!(failures.is_empty());

        assert_eq!(records[0].municipio, "Porto Alegre");
        assert_eq!(records[0].ibge, 4314902);
        assert_eq!(records[0].year, 2021);
        assert_eq!(records[0].sex, Sex::Male);
        assert_eq!(records[0].quantity, 120.0);
        assert_eq!(records[0].latitude, -30.03);

        assert_eq!(records[1].ibge, 0);
        assert_eq!(records[1].sex, Sex::Blank);
        assert_eq!(records[1].quantity, 0.0);
    }

    #[test]
    fn jsonl_accepts_numbers_and_strings() {
        let input = concat!(
            "{\"municipio\":\"Canoas\",\"ibge\":4304606,\"latitude\":\"x\",\"longitude\":-51.18,",
            "\"year\":2019,\"sexo\":\"f\",\"quantidade\":\"33.5\"}\n",
            "\n",
            "{\"municipio\":\"Pelotas\",\"year\":\"2020\"}\n"
        );
        let (result, records, _) = run(input, IngestMode::Jsonl, ErrorPolicy::Stop);
        assert_eq!(result.expect("ingest").ok, 2);
        assert_eq!(records[0].sex, Sex::Female);
        assert_eq!(records[0].quantity, 33.5);
        assert_eq!(records[0].latitude, 0.0);
        assert_eq!(records[1].year, 2020);
        assert_eq!(records[1].ibge, 0);
    }

    #[test]
    fn stop_policy_fails_with_row_number() {
        let input = format!(
            "{HEADER}Canoas,1,0,0,2020,M,1\nCanoas,1,0,0,2020,X,1\nCanoas,1,0,0,2021,M,1\n"
        );
        let (result, records, _) = run(&input, IngestMode::Csv, ErrorPolicy::Stop);
        let err = result.expect_err("bad sexo");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.row(), Some(2));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn skip_policy_reports_and_continues() {
        let input = concat!(
            "{\"municipio\":\"Canoas\",\"year\":2020,\"quantidade\":-1}\n",
            "not json\n",
            "{\"municipio\":\"Canoas\",\"quantidade\":4}\n",
            "{\"municipio\":\"Canoas\",\"year\":2021,\"quantidade\":4}\n"
        );
        let (result, records, failures) = run(input, IngestMode::Jsonl, ErrorPolicy::Skip);
        let outcome = result.expect("ingest");
        assert_eq!(outcome.rows_total, 4);
        assert_eq!(outcome.ok, 1);
        assert_eq!(outcome.failed, 3);
        assert_eq!(records.len(), 1);
        let rows: Vec<u64> = failures.iter().map(|failure| failure.row).collect();
        assert_eq!(rows, vec![1, 2, 3]);
        assert!(failures[1].snippet.as_deref() == Some("not json"));
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let (result, _, _) = run(
            "municipio,ibge\nCanoas,1\n",
            IngestMode::Csv,
            ErrorPolicy::Skip,
        );
        let err = result.expect_err("missing year");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn auto_mode_uses_extension_then_first_byte() {
        assert_eq!(IngestMode::Auto.for_path(Path::new("a.CSV")), IngestMode::Csv);
        assert_eq!(IngestMode::Auto.for_path(Path::new("a.jsonl")), IngestMode::Jsonl);
        assert_eq!(IngestMode::Auto.for_path(Path::new("-")), IngestMode::Auto);
        assert_eq!(IngestMode::Csv.for_path(Path::new("a.jsonl")), IngestMode::Csv);

        let (result, records, _) = run(
            "  {\"municipio\":\"Canoas\",\"year\":2020}\n",
            IngestMode::Auto,
            ErrorPolicy::Stop,
        );
        assert_eq!(result.expect("ingest").ok, 1);
        assert_eq!(records[0].municipio, "Canoas");

        let input = format!("{HEADER}Canoas,,,,2020,,\n");
        let (result, _, _) = run(&input, IngestMode::Auto, ErrorPolicy::Stop);
        assert_eq!(result.expect("ingest").ok, 1);
    }

    #[test]
    fn consumer_errors_propagate() {
        let input = format!("{HEADER}Canoas,,,,2020,,\n");
        let result = ingest(
            input.as_bytes(),
            IngestConfig {
                mode: IngestMode::Csv,
                errors: ErrorPolicy::Skip,
            },
            |_| Err(Error::new(ErrorKind::Io).with_message("disk full")),
            |_| {},
        );
        assert_eq!(result.expect_err("consumer").kind(), ErrorKind::Io);
    }
}
