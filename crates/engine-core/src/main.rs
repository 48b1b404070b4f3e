use anyhow::Result;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use engine_core::agent::{run_agent_loop, AgentLoopInput};
use engine_core::config::Config;
use engine_core::error::EngineError;
use engine_core::models::{EnrichRequest, EnrichmentResult};
use engine_core::services::Services;
use engine_core::{finalize, summarizer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// `POST /api/enrich` (spec §6): the one request entry point into the agent
/// loop. Validates the body, applies any operator corrections as trusted
/// facts, runs the agent loop to completion, finalises the result, fires the
/// session summariser, and returns the `EnrichmentResult`.
async fn enrich(
    State(services): State<Arc<Services>>,
    Json(request): Json<EnrichRequest>,
) -> Result<Json<EnrichmentResult>, EngineError> {
    if request.query.trim().chars().count() < 2 {
        return Err(EngineError::InvalidRequest("query must be at least 2 characters".to_string()));
    }

    let session_id = request.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!("enrich", session_id = %session_id, entity = request.entity.as_deref().unwrap_or(""));

    for correction in &request.corrections {
        if let Err(e) = services.facts.set_trusted_fact(
            &services.entities,
            &correction.entity,
            &correction.field,
            correction.value.clone(),
            correction.source.clone(),
        ) {
            warn!(
                "failed to apply correction for {}/{}: {}",
                correction.entity,
                correction.field,
                e
            );
        }
    }

    let cancel = CancellationToken::new();
    let loop_input = AgentLoopInput {
        session_id: &session_id,
        query: &request.query,
        entity_hint: request.entity.as_deref(),
        expected_variables: &request.variables,
        intensity: request.research_intensity,
        cancel: cancel.clone(),
    };

    let deadline = Duration::from_secs(services.config.request_timeout_secs);
    let loop_output = match tokio::time::timeout(deadline, run_agent_loop(&services, loop_input).instrument(span.clone())).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(EngineError::Internal(e)),
        Err(_) => {
            cancel.cancel();
            warn!("agent loop for session {} exceeded its {:?} deadline; aborting", session_id, deadline);
            return Err(EngineError::Internal(anyhow::anyhow!("request deadline exceeded")));
        }
    };

    let default_entity_type = loop_output.router_output.entity_type.clone();
    let result = finalize::finalize(
        &services,
        &loop_output.final_text,
        request.entity.as_deref(),
        default_entity_type.as_deref(),
    );

    summarizer::maybe_summarise(&services, &session_id, request.username.as_deref()).await;

    Ok(Json(result))
}

fn app(services: Arc<Services>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/enrich", post(enrich))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "engine_core=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Model: {}", config.openai_model);
    info!("  Search provider: {}", config.search_provider);

    {
        use diesel::prelude::*;
        use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
        pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

        let mut conn = diesel::PgConnection::establish(&config.database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migration failed: {}", e))?;
        info!("Database migrations applied");
    }

    let http_port = config.http_port;
    let services = Arc::new(Services::build(config)?);

    let router = app(services);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port)).await?;
    info!("enrichd listening on port {}", http_port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!("server error: {}", e);
            anyhow::anyhow!(e)
        })?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_reports_ok() {
        let response = health_check().await;
        assert!(response.0.ok);
    }
}
