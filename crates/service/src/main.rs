use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query as UrlQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use knowhub_rag::{
    index_fragments, EmbeddingClient, Escalation, EscalationPolicy, EscalationStatus, Fragment,
    IndexError, Principal, Query, RagConfig, RagError, RagPipeline, RagStore,
};

const ADMIN_ROLE: &str = "admin";

struct AppState {
    pipeline: RagPipeline,
    store: RagStore,
    embed_client: EmbeddingClient,
    escalation: EscalationPolicy,
    default_top_k: usize,
}

impl AppState {
    fn from_config(config: &RagConfig) -> Result<Self, RagError> {
        let pipeline = RagPipeline::from_config(config)?;
        let store = RagStore::open(&config.db_path, config.embedding_dimensions)
            .map_err(RagError::configuration)?;
        Ok(Self {
            pipeline,
            store,
            embed_client: EmbeddingClient::from_config(config)?,
            escalation: EscalationPolicy::new(config.escalation_threshold),
            default_top_k: config.top_k,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config = RagConfig::from_env()?;
    let state = Arc::new(AppState::from_config(&config)?);
    info!(
        db = %config.db_path.display(),
        provider = config.provider.as_str(),
        dimensions = config.embedding_dimensions,
        "pipeline ready"
    );
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/questions/ask", post(handle_ask))
        .route("/domains/:domain/fragments", post(handle_index))
        .route("/escalations", get(list_escalations))
        .route("/escalations/:id/resolve", post(resolve_escalation))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    question_text: String,
    domain_id: String,
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    answer_text: String,
    confidence: f32,
    citations: Vec<String>,
    explicit_citations: Vec<String>,
    escalated: bool,
    escalation_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct EscalationFilter {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FragmentUpload {
    id: String,
    text: String,
    source_document_id: String,
}

#[derive(Debug, Serialize)]
struct IndexResponse {
    domain_id: String,
    fragments_indexed: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_ask(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    let principal = principal_from_headers(&headers);
    let query = Query::new(
        body.question_text,
        body.domain_id,
        body.top_k.unwrap_or(state.default_top_k),
    );
    let result = state.pipeline.answer(&query).await?;
    let escalation = match state
        .escalation
        .escalation_for(&query, &result, principal.as_ref())
    {
        Some(record) => {
            let store = state.store.clone();
            let saved = blocking(move || store.record_escalation(&record)).await?;
            warn!(
                escalation = saved.id,
                domain = %query.domain_id,
                confidence = result.confidence,
                subject = saved.subject_id.as_deref().unwrap_or("anonymous"),
                "answer below escalation threshold"
            );
            Some(saved.id)
        }
        None => None,
    };
    Ok(Json(AskResponse {
        answer_text: result.text,
        confidence: result.confidence,
        citations: result.citations,
        explicit_citations: result.explicit_citations,
        escalated: escalation.is_some(),
        escalation_id: escalation,
    }))
}

async fn list_escalations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    UrlQuery(filter): UrlQuery<EscalationFilter>,
) -> Result<Json<Vec<Escalation>>, AppError> {
    require_admin(&headers)?;
    let status = match filter.status.as_deref() {
        Some(raw) => Some(
            EscalationStatus::from_str(raw)
                .ok_or_else(|| AppError::bad_request(format!("unknown status {raw}")))?,
        ),
        None => None,
    };
    let store = state.store.clone();
    let escalations = blocking(move || store.list_escalations(status)).await?;
    Ok(Json(escalations))
}

async fn resolve_escalation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<i64>,
) -> Result<Json<Escalation>, AppError> {
    let admin = require_admin(&headers)?;
    let store = state.store.clone();
    let resolved = blocking(move || store.resolve_escalation(id))
        .await?
        .ok_or(AppError::NotFound("escalation"))?;
    info!(escalation = id, resolved_by = %admin.subject_id, "escalation resolved");
    Ok(Json(resolved))
}

async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Storage(e.into()))?
        .map_err(AppError::Storage)
}

async fn handle_index(
    State(state): State<Arc<AppState>>,
    AxumPath(domain): AxumPath<String>,
    Json(body): Json<Vec<FragmentUpload>>,
) -> Result<Json<IndexResponse>, AppError> {
    if body.is_empty() {
        return Err(AppError::bad_request("no fragments supplied"));
    }
    let fragments = body
        .into_iter()
        .map(|f| Fragment {
            id: f.id,
            text: f.text,
            source_document_id: f.source_document_id,
            domain_id: domain.clone(),
        })
        .collect();
    let written = index_fragments(&state.store, &state.embed_client, fragments).await?;
    Ok(Json(IndexResponse {
        domain_id: domain,
        fragments_indexed: written,
    }))
}

/// The authenticating proxy in front of this service forwards the caller's
/// identity; the pipeline itself never needs it.
fn principal_from_headers(headers: &HeaderMap) -> Option<Principal> {
    let subject_id = headers.get("x-subject-id")?.to_str().ok()?.trim();
    if subject_id.is_empty() {
        return None;
    }
    Some(Principal {
        subject_id: subject_id.to_string(),
        role_id: headers
            .get("x-role-id")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    })
}

fn require_admin(headers: &HeaderMap) -> Result<Principal, AppError> {
    let principal = principal_from_headers(headers).ok_or(AppError::Unauthorized)?;
    if principal.role_id.as_deref() != Some(ADMIN_ROLE) {
        return Err(AppError::Forbidden);
    }
    Ok(principal)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing caller identity")]
    Unauthorized,
    #[error("admin role required")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(anyhow::Error),
    #[error(transparent)]
    Pipeline(#[from] RagError),
}

impl AppError {
    fn bad_request<E: std::fmt::Display>(msg: E) -> Self {
        Self::BadRequest(format!("{msg:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            err @ AppError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
            }
            err @ AppError::Forbidden => (StatusCode::FORBIDDEN, err.to_string()).into_response(),
            err @ AppError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
            AppError::Index(err) if err.is_caller_error() => {
                (StatusCode::BAD_REQUEST, err.to_string()).into_response()
            }
            AppError::Index(err) => {
                error!("index_error" = %err);
                (StatusCode::BAD_GATEWAY, "could not index fragments").into_response()
            }
            AppError::Storage(err) => {
                error!(error = ?err, "storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response()
            }
            AppError::Pipeline(RagError::InvalidQuery(msg)) => {
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            AppError::Pipeline(err @ RagError::Configuration(_)) => {
                error!("configuration_error" = %err);
                (StatusCode::SERVICE_UNAVAILABLE, "service misconfigured").into_response()
            }
            AppError::Pipeline(err) => {
                error!("pipeline_error" = %err);
                (StatusCode::BAD_GATEWAY, "could not produce an answer").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowhub_rag::{EmbeddingProvider, LlmProvider, RetrievalError};
    use std::time::Duration;
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir) -> RagConfig {
        RagConfig {
            db_path: dir.path().join("svc.sqlite"),
            provider: LlmProvider::Local,
            embedding_provider: EmbeddingProvider::Hash,
            embedding_dimensions: 64,
            ..RagConfig::default()
        }
    }

    fn offline_state(dir: &TempDir) -> Arc<AppState> {
        Arc::new(AppState::from_config(&offline_config(dir)).unwrap())
    }

    fn caller(subject: &str, role: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-subject-id", subject.parse().unwrap());
        if let Some(role) = role {
            headers.insert("x-role-id", role.parse().unwrap());
        }
        headers
    }

    fn upload(id: &str, text: &str, document: &str) -> FragmentUpload {
        FragmentUpload {
            id: id.to_string(),
            text: text.to_string(),
            source_document_id: document.to_string(),
        }
    }

    async fn ask(state: &Arc<AppState>, headers: HeaderMap, question: &str) -> AskResponse {
        let Json(resp) = handle_ask(
            State(state.clone()),
            headers,
            Json(AskRequest {
                question_text: question.to_string(),
                domain_id: "hr".to_string(),
                top_k: None,
            }),
        )
        .await
        .unwrap();
        resp
    }

    #[tokio::test]
    async fn empty_domain_is_escalated() {
        let dir = TempDir::new().unwrap();
        let state = offline_state(&dir);
        let Json(resp) = handle_ask(
            State(state),
            HeaderMap::new(),
            Json(AskRequest {
                question_text: "What is the leave policy?".to_string(),
                domain_id: "hr".to_string(),
                top_k: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.answer_text, "No relevant documents found.");
        assert!(resp.escalated);
        assert!(resp.escalation_id.is_some());
    }

    #[tokio::test]
    async fn escalations_are_stored_listed_and_resolved() {
        let dir = TempDir::new().unwrap();
        let state = offline_state(&dir);
        let resp = ask(&state, caller("u-7", None), "Who signs purchase orders?").await;
        let id = resp.escalation_id.unwrap();

        let Json(pending) = list_escalations(
            State(state.clone()),
            caller("boss", Some("admin")),
            UrlQuery(EscalationFilter {
                status: Some("pending".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].question_text, "Who signs purchase orders?");
        assert_eq!(pending[0].subject_id.as_deref(), Some("u-7"));
        assert_eq!(pending[0].status, EscalationStatus::Pending);

        let Json(resolved) = resolve_escalation(
            State(state.clone()),
            caller("boss", Some("admin")),
            AxumPath(id),
        )
        .await
        .unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);

        let Json(pending) = list_escalations(
            State(state.clone()),
            caller("boss", Some("admin")),
            UrlQuery(EscalationFilter {
                status: Some("pending".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(pending.is_empty());

        let missing = resolve_escalation(
            State(state),
            caller("boss", Some("admin")),
            AxumPath(id + 100),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn escalation_routes_need_an_admin() {
        let dir = TempDir::new().unwrap();
        let state = offline_state(&dir);
        let anonymous = list_escalations(
            State(state.clone()),
            HeaderMap::new(),
            UrlQuery(EscalationFilter::default()),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(anonymous.into_response().status(), StatusCode::UNAUTHORIZED);

        let reviewer = resolve_escalation(State(state), caller("u-1", Some("reviewer")), AxumPath(1))
            .await
            .err()
            .unwrap();
        assert_eq!(reviewer.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn embedding_outage_during_upload_is_a_gateway_error() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        let state = Arc::new(AppState {
            pipeline: RagPipeline::from_config(&config).unwrap(),
            store: RagStore::open(&config.db_path, config.embedding_dimensions).unwrap(),
            embed_client: EmbeddingClient::ollama(
                "http://127.0.0.1:9",
                "nomic-embed-text",
                config.embedding_dimensions,
                Duration::from_secs(2),
            )
            .unwrap(),
            escalation: EscalationPolicy::default(),
            default_top_k: config.top_k,
        });
        let err = handle_index(
            State(state),
            AxumPath("hr".to_string()),
            Json(vec![upload("hr-1", "Annual leave is twenty days.", "handbook")]),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn bad_uploads_are_the_callers_fault() {
        let dir = TempDir::new().unwrap();
        let state = offline_state(&dir);
        let blank = handle_index(
            State(state.clone()),
            AxumPath("hr".to_string()),
            Json(vec![upload("hr-1", "  ", "handbook")]),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(blank.into_response().status(), StatusCode::BAD_REQUEST);

        handle_index(
            State(state.clone()),
            AxumPath("hr".to_string()),
            Json(vec![upload("f1", "Annual leave is twenty days.", "hr-handbook")]),
        )
        .await
        .unwrap();
        let moved = handle_index(
            State(state),
            AxumPath("it".to_string()),
            Json(vec![upload("f1", "VPN setup guide.", "it-handbook")]),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(moved.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn indexed_fragments_are_answered_and_cited() {
        let dir = TempDir::new().unwrap();
        let state = offline_state(&dir);
        let Json(indexed) = handle_index(
            State(state.clone()),
            AxumPath("hr".to_string()),
            Json(vec![upload("hr-1", "Annual leave is twenty days per year.", "handbook")]),
        )
        .await
        .unwrap();
        assert_eq!(indexed.fragments_indexed, 1);

        let Json(resp) = handle_ask(
            State(state),
            HeaderMap::new(),
            Json(AskRequest {
                question_text: "How much annual leave?".to_string(),
                domain_id: "hr".to_string(),
                top_k: Some(3),
            }),
        )
        .await
        .unwrap();
        assert!(resp.answer_text.contains("(Chunk ID: hr-1)"));
        assert_eq!(resp.confidence, 0.9);
        assert_eq!(resp.citations, vec!["hr-1"]);
        assert!(!resp.escalated);
        assert!(resp.escalation_id.is_none());
    }

    #[test]
    fn errors_map_to_statuses() {
        let status = |err: AppError| err.into_response().status();
        assert_eq!(
            status(AppError::Pipeline(RagError::InvalidQuery("empty"))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(AppError::Pipeline(RagError::Configuration("x".into()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(AppError::Pipeline(RagError::Retrieval(
                RetrievalError::EmbeddingUnavailable("down".into())
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(AppError::Pipeline(RagError::Generation("x".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(AppError::Index(IndexError::Store("disk full".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(AppError::Index(IndexError::InvalidFragment("no text".into()))),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn principal_needs_subject_header() {
        let mut headers = HeaderMap::new();
        assert!(principal_from_headers(&headers).is_none());
        headers.insert("x-subject-id", "u-1".parse().unwrap());
        headers.insert("x-role-id", "reviewer".parse().unwrap());
        let principal = principal_from_headers(&headers).unwrap();
        assert_eq!(principal.subject_id, "u-1");
        assert_eq!(principal.role_id.as_deref(), Some("reviewer"));
    }
}
