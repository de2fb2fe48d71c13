use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clap::Parser;
use loanbook_api::{
    BackupReport, LoanbookApi, RestoreSummary, SchemaStatus, UpsertClientRequest,
    UpsertClientResult, API_CONTRACT_VERSION,
};
use loanbook_core::{ClientError, ClientRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: LoanbookApi,
    uploads_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RepaymentRequest {
    amount: Value,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    time: String,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    deleted: bool,
    id: i64,
}

#[derive(Debug, Parser)]
#[command(name = "loanbook-service")]
#[command(about = "Local HTTP service for the Loanbook client-loan tracker")]
struct Args {
    #[arg(long, default_value = "./loanbook.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "./clients-backup.json")]
    backup: PathBuf,
    #[arg(long, default_value = "./uploads")]
    uploads_dir: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl From<ClientError> for ServiceError {
    fn from(err: ClientError) -> Self {
        let kind = match err {
            ClientError::Validation(_) => "validation",
            ClientError::NotFound(_) => "not_found",
            ClientError::Store(_) => "store",
        };
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            "not_found" => StatusCode::NOT_FOUND,
            "store" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.error, "request failed against the store");
        }
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/clients", get(clients_list).post(clients_upsert))
        .route("/v1/clients/:id", put(clients_update).delete(clients_delete))
        .route("/v1/clients/:id/repayment", post(clients_repayment))
        .route("/v1/backup", post(backup_export))
        .route("/v1/backup/download", get(backup_download))
        .route("/v1/restore", post(restore_stored))
        .route("/v1/restore/upload", post(restore_upload))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState {
        api: LoanbookApi::new(args.db, args.backup),
        uploads_dir: args.uploads_dir,
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "loanbook service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Result<Json<ServiceEnvelope<HealthResponse>>, ServiceError> {
    let time = loanbook_core::now_rfc3339()?;
    Ok(Json(envelope(HealthResponse { status: "ok", time })))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.migrate()?;
    Ok(Json(envelope(status)))
}

async fn clients_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<ClientRecord>>>, ServiceError> {
    let clients = state.api.list_clients()?;
    Ok(Json(envelope(clients)))
}

async fn clients_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<UpsertClientRequest>,
) -> Result<Json<ServiceEnvelope<UpsertClientResult>>, ServiceError> {
    let result = state.api.upsert_client(request)?;
    info!(status = result.status.as_str(), id = result.client.id.0, "client upserted");
    Ok(Json(envelope(result)))
}

async fn clients_update(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(request): Json<UpsertClientRequest>,
) -> Result<Json<ServiceEnvelope<ClientRecord>>, ServiceError> {
    let client = state.api.update_client(id, request)?;
    Ok(Json(envelope(client)))
}

async fn clients_delete(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceEnvelope<DeleteResponse>>, ServiceError> {
    state.api.delete_client(id)?;
    Ok(Json(envelope(DeleteResponse { deleted: true, id })))
}

async fn clients_repayment(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(request): Json<RepaymentRequest>,
) -> Result<Json<ServiceEnvelope<ClientRecord>>, ServiceError> {
    let client = state.api.apply_repayment(id, &request.amount)?;
    Ok(Json(envelope(client)))
}

async fn backup_export(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<BackupReport>>, ServiceError> {
    let report = state.api.export_backup()?;
    info!(count = report.count, file = %report.file, "backup snapshot exported");
    Ok(Json(envelope(report)))
}

async fn backup_download(State(state): State<ServiceState>) -> Result<Response, ServiceError> {
    let bytes = fs::read(state.api.backup_path()).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServiceError::from(ClientError::NotFound(
                "no backup snapshot has been exported".to_string(),
            ))
        } else {
            ServiceError::from(ClientError::Store(format!(
                "failed to read backup snapshot: {err}"
            )))
        }
    })?;
    Ok((StatusCode::OK, [("content-type", "application/json")], bytes).into_response())
}

async fn restore_stored(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RestoreSummary>>, ServiceError> {
    let summary = state.api.restore_from_backup()?;
    info!(
        inserted = summary.inserted,
        failed = summary.failed,
        skipped = summary.skipped,
        "restore from stored snapshot finished"
    );
    Ok(Json(envelope(summary)))
}

async fn restore_upload(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<RestoreSummary>>, ServiceError> {
    fs::create_dir_all(&state.uploads_dir).map_err(|err| {
        ServiceError::from(ClientError::Store(format!(
            "failed to create uploads directory {}: {err}",
            state.uploads_dir.display()
        )))
    })?;

    // Persist the payload to an ephemeral file; the API deletes it after
    // reading exactly once, whatever the reconciliation outcome.
    let upload_path = state.uploads_dir.join(format!("upload-{}.json", ulid::Ulid::new()));
    fs::write(&upload_path, &body).map_err(|err| {
        ServiceError::from(ClientError::Store(format!(
            "failed to persist uploaded snapshot {}: {err}",
            upload_path.display()
        )))
    })?;

    let summary = state.api.restore_from_upload(&upload_path)?;
    info!(
        inserted = summary.inserted,
        failed = summary.failed,
        skipped = summary.skipped,
        "restore from uploaded snapshot finished"
    );
    Ok(Json(envelope(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_path(suffix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("loanbook-service-{}{suffix}", ulid::Ulid::new()))
    }

    fn temp_state() -> ServiceState {
        ServiceState {
            api: LoanbookApi::new(
                unique_temp_path(".sqlite3"),
                unique_temp_path("-backup.json"),
            ),
            uploads_dir: unique_temp_path("-uploads"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string())),
            None => builder.body(axum::body::Body::empty()),
        };
        let request = match request {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn data(value: &Value) -> &Value {
        value.get("data").unwrap_or_else(|| panic!("missing data in envelope: {value}"))
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok_with_contract_versions() {
        let router = app(temp_state());
        let response = send(router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data(&value).get("status").and_then(Value::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(temp_state());
        let response = send(router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes).to_string();
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/restore/upload"));
    }

    #[tokio::test]
    async fn upsert_then_list_round_trips() {
        let state = temp_state();
        let router = app(state);

        let created = send(
            router.clone(),
            "POST",
            "/v1/clients",
            Some(serde_json::json!({"name": "Ana", "loan": "100", "email": null, "phone": null})),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);
        let created_value = response_json(created).await;
        assert_eq!(
            data(&created_value).get("status").and_then(Value::as_str),
            Some("created")
        );

        let updated = send(
            router.clone(),
            "POST",
            "/v1/clients",
            Some(serde_json::json!({"name": "Ana", "loan": 150, "email": null, "phone": null})),
        )
        .await;
        let updated_value = response_json(updated).await;
        assert_eq!(
            data(&updated_value).get("status").and_then(Value::as_str),
            Some("updated")
        );

        let listed = send(router, "GET", "/v1/clients", None).await;
        let listed_value = response_json(listed).await;
        let clients = match data(&listed_value).as_array() {
            Some(clients) => clients,
            None => panic!("clients listing should be an array: {listed_value}"),
        };
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].get("loan").and_then(Value::as_f64), Some(150.0));
    }

    #[tokio::test]
    async fn validation_errors_map_to_bad_request_with_kind() {
        let router = app(temp_state());
        let response = send(
            router,
            "POST",
            "/v1/clients",
            Some(serde_json::json!({"name": "", "loan": 10, "email": null, "phone": null})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("validation"));
    }

    #[tokio::test]
    async fn repayment_on_missing_id_maps_to_not_found() {
        let router = app(temp_state());
        let response = send(
            router,
            "POST",
            "/v1/clients/9999/repayment",
            Some(serde_json::json!({"amount": 10})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("not_found"));
    }

    #[tokio::test]
    async fn backup_download_before_export_is_not_found() {
        let router = app(temp_state());
        let response = send(router, "GET", "/v1/backup/download", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_restore_flow_reports_skips_on_the_same_store() {
        let state = temp_state();
        let backup_path = state.api.backup_path().to_path_buf();
        let router = app(state);

        for (name, loan) in [("Ana", 100), ("Bo", 200)] {
            let response = send(
                router.clone(),
                "POST",
                "/v1/clients",
                Some(serde_json::json!({"name": name, "loan": loan, "email": null, "phone": null})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let exported = send(router.clone(), "POST", "/v1/backup", None).await;
        assert_eq!(exported.status(), StatusCode::OK);
        let exported_value = response_json(exported).await;
        assert_eq!(data(&exported_value).get("count").and_then(Value::as_u64), Some(2));

        let restored = send(router.clone(), "POST", "/v1/restore", None).await;
        assert_eq!(restored.status(), StatusCode::OK);
        let restored_value = response_json(restored).await;
        assert_eq!(data(&restored_value).get("inserted").and_then(Value::as_u64), Some(0));
        assert_eq!(data(&restored_value).get("skipped").and_then(Value::as_u64), Some(2));

        let download = send(router, "GET", "/v1/backup/download", None).await;
        assert_eq!(download.status(), StatusCode::OK);

        let _ = fs::remove_file(backup_path);
    }

    #[tokio::test]
    async fn upload_restore_inserts_and_cleans_the_ephemeral_file() {
        let state = temp_state();
        let uploads_dir = state.uploads_dir.clone();
        let router = app(state);

        let response = send(
            router.clone(),
            "POST",
            "/v1/restore/upload",
            Some(serde_json::json!([
                {"name": "Ana", "loan": 100},
                {"name": "Bo", "loan": "200", "created_at": "2025-01-01T00:00:00Z"}
            ])),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(data(&value).get("inserted").and_then(Value::as_u64), Some(2));

        let leftovers = match fs::read_dir(&uploads_dir) {
            Ok(entries) => entries.count(),
            Err(err) => panic!("uploads dir should exist after upload: {err}"),
        };
        assert_eq!(leftovers, 0);

        let rejected = send(
            router,
            "POST",
            "/v1/restore/upload",
            Some(serde_json::json!({"name": "solo", "loan": 1})),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

        let leftovers = match fs::read_dir(&uploads_dir) {
            Ok(entries) => entries.count(),
            Err(err) => panic!("uploads dir should exist after upload: {err}"),
        };
        assert_eq!(leftovers, 0);
    }
}
