//! Purpose: Hold top-level CLI command dispatch for `matriculas`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Query commands never write to the dataset; only `build` publishes.
//! Invariants: Output envelopes and exit code semantics are defined in `main.rs` helpers.

use super::*;
use matriculas::api::{
    DatasetBuilder, DiffQuery, SearchQuery, Sex, resolve_current, validate_pair,
};

pub(super) fn dispatch_command(
    command: Command,
    target: DatasetTarget,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "matriculas", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Build {
            input,
            input_mode,
            errors,
        } => {
            let DatasetTarget::Dir(dir) = &target else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("build publishes into --dir and cannot target --bin/--index")
                    .with_hint("Drop --bin/--index; query the new build with --dir."));
            };
            let dataset = target.label();
            let reader = open_input(&input)?;
            let config = ingest::IngestConfig {
                mode: input_mode_to_ingest(input_mode, &input),
                errors: error_policy_to_ingest(errors),
            };

            let mut builder = DatasetBuilder::begin(dir)?;
            let outcome = ingest::ingest(
                reader,
                config,
                |record| builder.append(&record).map(|_| ()),
                |failure| ingest_failure_notice(&failure, &dataset, color_mode),
            )?;
            if outcome.failed > 0 {
                ingest_summary_notice(&outcome, &dataset, color_mode);
            }
            let summary = builder.publish()?;

            emit_json(json!({
                "build": to_json(&summary)?,
                "ingest": {
                    "rows": outcome.rows_total,
                    "ok": outcome.ok,
                    "skipped": outcome.failed,
                },
            }));
            Ok(RunOutcome::ok())
        }
        Command::Search {
            municipio,
            year_from,
            year_to,
            sex,
            page,
            page_size,
            format,
        } => {
            let query = SearchQuery::new(municipio)
                .with_years(year_from, year_to)
                .with_sex(parse_sex(sex.as_deref())?)
                .with_page(page, page_size);
            let service = target.open()?;
            let result = service.search(&query)?;
            match format {
                SearchFormat::Json => emit_json(to_json(&result)?),
                SearchFormat::Text => emit_search_text(&result),
            }
            Ok(RunOutcome::ok())
        }
        Command::Diff {
            municipio,
            year_from,
            year_to,
            sex,
        } => {
            let query = DiffQuery::new(municipio.clone(), year_from, year_to)
                .with_sex(parse_sex(sex.as_deref())?);
            let service = target.open()?;
            let report = service.difference(&query)?;
            emit_json(json!({
                "municipio": municipio,
                "difference": to_json(&report)?,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Info => {
            let service = target.open()?;
            emit_json(json!({ "dataset": to_json(service.info())? }));
            Ok(RunOutcome::ok())
        }
        Command::Verify { json } => {
            let paths = match &target {
                DatasetTarget::Dir(dir) => resolve_current(dir)?.1,
                DatasetTarget::Pair(paths) => paths.clone(),
            };
            let report = validate_pair(&paths)?;
            if json || !io::stdout().is_terminal() {
                emit_json(json!({ "report": to_json(&report)? }));
            } else {
                emit_verify_human(&report);
            }
            if report.status == ValidationStatus::Corrupt {
                return Ok(RunOutcome::with_code(to_exit_code(ErrorKind::Mismatch)));
            }
            Ok(RunOutcome::ok())
        }
        Command::Serve {
            bind,
            allow_non_loopback,
            max_page_size,
        } => {
            let config = serve::ServeConfig {
                bind: parse_bind(&bind)?,
                allow_non_loopback,
                max_page_size,
            };
            serve::validate_config(&config)?;
            let service = target.open()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config, service))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn parse_sex(value: Option<&str>) -> Result<Option<Sex>, Error> {
    value.map_or(Ok(None), Sex::parse_filter)
}
