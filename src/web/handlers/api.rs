use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::pipeline::cache::CacheStats;
use crate::pipeline::history::{ConversationHistory, ConversationTurn};
use crate::pipeline::metrics::MetricsSummary;
use crate::schema::SchemaSnapshot;
use crate::web::state::AppState;

// Query types

#[derive(Debug, Deserialize, Clone)]
pub struct NlQueryRequest {
    pub question: String,
    /// Conversation to continue; omitted for a one-off question
    #[serde(default)]
    pub session_id: Option<String>,
    /// Sequence number of an earlier question this one rephrases
    #[serde(default)]
    pub replaces: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub changed: bool,
    pub schema_version: String,
    pub table_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub table_count: usize,
    pub schema_version: String,
    pub last_schema_refresh: DateTime<Utc>,
    pub session_count: usize,
    pub llm_backend: String,
    pub llm_model: String,
    pub cache: CacheStats,
    pub metrics: MetricsSummary,
}

// API Implementations

pub async fn nl_query(State(state): State<Arc<AppState>>, Json(payload): Json<NlQueryRequest>) -> Response {
    let question = payload.question.trim();
    if question.is_empty() {
        return (StatusCode::BAD_REQUEST, "Question must not be empty".to_string()).into_response();
    }

    let start = Instant::now();
    let schema = state.schema_manager.snapshot().await;
    info!("Received NL query: {}", question);

    let outcome = match payload.session_id.as_deref() {
        Some(session_id) => {
            state
                .pipeline
                .run_in_session(&state.sessions, session_id, question, payload.replaces, &schema)
                .await
        }
        None => {
            state
                .pipeline
                .run_query(question, &ConversationHistory::new(), &schema)
                .await
        }
    };

    match outcome {
        Ok(answer) => {
            info!(
                "Answered in {}ms (cache hit: {}, rows: {})",
                start.elapsed().as_millis(),
                answer.cache_hit,
                answer.result.row_count()
            );
            (StatusCode::OK, Json(answer)).into_response()
        }
        Err(failure) => {
            warn!("Question failed: {}", failure);
            (StatusCode::UNPROCESSABLE_ENTITY, Json(failure)).into_response()
        }
    }
}

pub async fn get_schema(State(state): State<Arc<AppState>>) -> Json<SchemaSnapshot> {
    Json(state.schema_manager.snapshot().await.as_ref().clone())
}

pub async fn refresh_schema(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshResponse>, (StatusCode, String)> {
    let changed = state.schema_manager.refresh(&state.pipeline).await.map_err(|e| {
        error!("Failed to refresh schema: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to refresh schema: {}", e))
    })?;

    let snapshot = state.schema_manager.snapshot().await;
    Ok(Json(RefreshResponse {
        changed,
        schema_version: snapshot.version().to_string(),
        table_count: snapshot.tables().len(),
    }))
}

pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionHistory>, (StatusCode, String)> {
    match state.sessions.history(&session_id).await {
        Some(history) => Ok(Json(SessionHistory {
            session_id,
            turns: history.turns().to_vec(),
        })),
        None => Err((StatusCode::NOT_FOUND, "Session not found".to_string())),
    }
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();
    let snapshot = state.schema_manager.snapshot().await;

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        table_count: snapshot.tables().len(),
        schema_version: snapshot.version().to_string(),
        last_schema_refresh: state.schema_manager.last_refresh().await,
        session_count: state.sessions.len(),
        llm_backend: state.config.llm.backend.clone(),
        llm_model: state.config.llm.model.clone(),
        cache: state.pipeline.cache_stats(),
        metrics: state.pipeline.metrics(),
    })
}
