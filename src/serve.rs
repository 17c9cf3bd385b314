//! Purpose: Serve read-only enrollment queries over HTTP/JSON.
//! Exports: `ServeConfig`, `serve`, `validate_config`.
//! Role: Axum-based loopback server over one shared `QueryService`.
//! Invariants: Error envelopes are `{"error":{kind,message,...}}`; kinds remain stable.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Queries touch the mmap'd store, so they run on the blocking pool.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;

use matriculas::api::{
    DiffQuery, Error, ErrorKind, QueryService, SearchQuery, Sex, DEFAULT_PAGE_SIZE, normalize_opt,
};

pub const DEFAULT_MAX_PAGE_SIZE: u32 = 1000;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub max_page_size: u32,
}

struct AppState {
    service: QueryService,
    max_page_size: u32,
}

pub async fn serve(config: ServeConfig, service: QueryService) -> Result<(), Error> {
    validate_config(&config)?;

    let state = Arc::new(AppState {
        service,
        max_page_size: config.max_page_size,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "serving");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(server_failed)?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(server_failed)?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    tracing::info!("server stopped");
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/info", get(info))
        .route("/v0/search", get(search))
        .route("/v0/difference", get(difference))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn server_failed(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("server failed")
        .with_source(err)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }
    if config.max_page_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-page-size must be greater than zero")
            .with_hint(format!("Use a positive value like {DEFAULT_MAX_PAGE_SIZE}.")));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    municipio: Option<String>,
    year_from: Option<u16>,
    year_to: Option<u16>,
    sex: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DifferenceParams {
    municipio: Option<String>,
    year_from: Option<u16>,
    year_to: Option<u16>,
    sex: Option<String>,
}

async fn healthz() -> Response {
    json_response(&json!({ "ok": true }))
}

async fn info(State(state): State<Arc<AppState>>) -> Response {
    json_response(&json!({ "dataset": state.service.info() }))
}

async fn search(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Response {
    let query = match params
        .map_err(query_rejection)
        .and_then(|Query(params)| search_query(params, state.max_page_size))
    {
        Ok(query) => query,
        Err(err) => return error_response(err),
    };
    let task_state = Arc::clone(&state);
    match run_blocking(move || task_state.service.search(&query)).await {
        Ok(page) => json_response(&page),
        Err(err) => error_response(err),
    }
}

async fn difference(
    State(state): State<Arc<AppState>>,
    params: Result<Query<DifferenceParams>, QueryRejection>,
) -> Response {
    let query = match params
        .map_err(query_rejection)
        .and_then(|Query(params)| difference_query(params))
    {
        Ok(query) => query,
        Err(err) => return error_response(err),
    };
    let task_state = Arc::clone(&state);
    match run_blocking(move || task_state.service.difference(&query)).await {
        Ok(report) => json_response(&report),
        Err(err) => error_response(err),
    }
}

fn search_query(params: SearchParams, max_page_size: u32) -> Result<SearchQuery, Error> {
    let name = required_municipio(params.municipio)?;
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size > max_page_size {
        return Err(Error::new(ErrorKind::Validation)
            .with_message(format!("page_size {page_size} exceeds the server limit"))
            .with_hint(format!("Use a page_size of at most {max_page_size}.")));
    }
    Ok(SearchQuery::new(name)
        .with_years(params.year_from, params.year_to)
        .with_sex(sex_filter(params.sex.as_deref())?)
        .with_page(params.page.unwrap_or(1), page_size))
}

fn difference_query(params: DifferenceParams) -> Result<DiffQuery, Error> {
    let name = required_municipio(params.municipio)?;
    let (Some(year_from), Some(year_to)) = (params.year_from, params.year_to) else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("year_from and year_to are required")
            .with_hint("Example: /v0/difference?municipio=Porto%20Alegre&year_from=2020&year_to=2021"));
    };
    Ok(DiffQuery::new(name, year_from, year_to).with_sex(sex_filter(params.sex.as_deref())?))
}

/// An absent or blank `municipio` is an invalid query, not a malformed request.
fn required_municipio(value: Option<String>) -> Result<String, Error> {
    match value {
        Some(name) if !normalize_opt(Some(&name)).is_empty() => Ok(name),
        _ => Err(Error::new(ErrorKind::Validation)
            .with_message("municipio is required")
            .with_hint("Pass ?municipio=<name>.")),
    }
}

fn sex_filter(value: Option<&str>) -> Result<Option<Sex>, Error> {
    match value {
        Some(value) => Sex::parse_filter(value),
        None => Ok(None),
    }
}

fn query_rejection(rejection: QueryRejection) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(rejection.body_text())
        .with_hint("Years are integers; page and page_size are positive integers.")
}

async fn run_blocking<T, F>(task: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("query task failed")
            .with_source(err)
    })?
}

fn json_response<T: Serialize>(payload: &T) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("matriculas-version", HeaderValue::from_static("0"));
    response
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::OutOfRange
        | ErrorKind::MalformedRecord
        | ErrorKind::Mismatch
        | ErrorKind::Io
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = error_status(err.kind());
    if status.is_server_error() {
        tracing::error!(error = %err, "query failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            offset: err.offset(),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("matriculas-version", HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::{
        DifferenceParams, ErrorKind, SearchParams, ServeConfig, difference_query, error_status,
        search_query, serve, validate_config,
    };
    use axum::http::StatusCode;
    use matriculas::api::{DatasetBuilder, QueryService, Sex};

    fn config(bind: &str) -> ServeConfig {
        ServeConfig {
            bind: bind.parse().expect("bind"),
            allow_non_loopback: false,
            max_page_size: 1000,
        }
    }

    fn empty_service() -> (tempfile::TempDir, QueryService) {
        let dir = tempfile::tempdir().expect("tempdir");
        DatasetBuilder::begin(dir.path())
            .expect("begin")
            .publish()
            .expect("publish");
        let service = QueryService::open_dataset(dir.path()).expect("open");
        (dir, service)
    }

    #[tokio::test]
    async fn serve_rejects_non_loopback_bind() {
        let (_dir, service) = empty_service();
        let err = serve(config("0.0.0.0:0"), service)
            .await
            .expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_loopback_allowed_with_opt_in() {
        let mut config = config("0.0.0.0:0");
        config.allow_non_loopback = true;
        validate_config(&config).expect("config ok");
    }

    #[test]
    fn max_page_size_must_be_positive() {
        let mut config = config("127.0.0.1:0");
        config.max_page_size = 0;
        let err = validate_config(&config).expect_err("expected usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn search_params_map_to_query() {
        let params = SearchParams {
            municipio: Some("Porto Alegre".to_string()),
            year_from: Some(2019),
            sex: Some("f".to_string()),
            page: Some(2),
            ..SearchParams::default()
        };
        let query = search_query(params, 1000).expect("query");
        assert_eq!(query.name, "Porto Alegre");
        assert_eq!(query.year_from, Some(2019));
        assert_eq!(query.year_to, None);
        assert_eq!(query.sex, Some(Sex::Female));
        assert_eq!(query.page, 2);
        assert_eq!(query.page_size, 20);
    }

    #[test]
    fn search_params_are_validated() {
        let err = search_query(SearchParams::default(), 1000).expect_err("missing municipio");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let params = SearchParams {
            municipio: Some(" \t ".to_string()),
            ..SearchParams::default()
        };
        let err = search_query(params, 1000).expect_err("blank municipio");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let params = SearchParams {
            municipio: Some("Canoas".to_string()),
            page_size: Some(5000),
            ..SearchParams::default()
        };
        let err = search_query(params, 1000).expect_err("page size");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let params = SearchParams {
            municipio: Some("Canoas".to_string()),
            sex: Some("X".to_string()),
            ..SearchParams::default()
        };
        let err = search_query(params, 1000).expect_err("sex");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn difference_requires_both_years() {
        let params = DifferenceParams {
            municipio: Some("Canoas".to_string()),
            year_from: Some(2020),
            ..DifferenceParams::default()
        };
        let err = difference_query(params).expect_err("year_to");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(error_status(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(ErrorKind::Usage), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(error_status(ErrorKind::Busy), StatusCode::LOCKED);
        assert_eq!(error_status(ErrorKind::Mismatch), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_status(ErrorKind::OutOfRange), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
