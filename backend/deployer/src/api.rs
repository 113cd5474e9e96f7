//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::contract::{Category, ContractStatus};
use crate::db;
use crate::errors::DeployerError;
use crate::events::EventRecord;
use crate::funding::{Contribution, ContributionOutcome, FundingSnapshot};
use crate::orchestrator::Orchestrator;
use crate::scheduler::Schedule;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/contracts", get(get_contracts))
        .route("/contracts/:name/events", get(get_contract_events))
        .route("/events", get(get_all_events))
        .route("/funding", get(get_funding))
        .route("/plan", get(get_plan))
        .route("/contributions", post(post_contribution))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ContractView {
    pub name: String,
    pub category: Category,
    pub status: ContractStatus,
    pub depends_on: Vec<String>,
    pub tx_id: Option<String>,
}

#[derive(Serialize)]
pub struct ContractsResponse {
    pub count: usize,
    pub contracts: Vec<ContractView>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub contract: String,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct AllEventsResponse {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only return events with a larger id.
    pub after: Option<i64>,
}

#[derive(Serialize)]
pub struct PlanResponse {
    pub order: Vec<String>,
    pub schedule: Schedule,
}

#[derive(Debug, Deserialize)]
pub struct ContributionRequest {
    pub tx_id: String,
    /// Micro-STX.
    pub amount: u64,
    pub contributor: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: DeployerError) -> Response {
    let status = match &e {
        DeployerError::FundingValidation(_) | DeployerError::Validation(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DeployerError::Http(_) | DeployerError::Rpc(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /contracts`
///
/// Every registered contract, including uncategorized ones.
pub async fn get_contracts(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let contracts: Vec<ContractView> = state
        .orchestrator
        .contracts()
        .await
        .into_iter()
        .map(|c| ContractView {
            name: c.name,
            category: c.category,
            status: c.status,
            depends_on: c.depends_on,
            tx_id: c.last_tx_id,
        })
        .collect();
    Json(ContractsResponse {
        count: contracts.len(),
        contracts,
    })
}

/// `GET /contracts/:name/events`
pub async fn get_contract_events(
    State(state): State<Arc<ApiState>>,
    Path(contract): Path<String>,
) -> Response {
    match db::get_events_for_contract(state.orchestrator.pool(), &contract).await {
        Ok(events) => {
            let count = events.len();
            (
                StatusCode::OK,
                Json(EventsResponse {
                    contract,
                    count,
                    events,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /events?after=<id>`
pub async fn get_all_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let after = query.after.unwrap_or(0);
    match db::get_events_after(state.orchestrator.pool(), after).await {
        Ok(events) => {
            let count = events.len();
            (StatusCode::OK, Json(AllEventsResponse { count, events })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /funding`
pub async fn get_funding(State(state): State<Arc<ApiState>>) -> Json<FundingSnapshot> {
    Json(state.orchestrator.funding().await)
}

/// `GET /plan`
///
/// The resolved order and the batches the next pass would submit.
pub async fn get_plan(State(state): State<Arc<ApiState>>) -> Json<PlanResponse> {
    let schedule = state.orchestrator.preview().await;
    Json(PlanResponse {
        order: state.orchestrator.plan().order.clone(),
        schedule,
    })
}

/// `POST /contributions`
///
/// Counts a confirmed on-chain contribution toward the funding curve.
pub async fn post_contribution(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ContributionRequest>,
) -> Response {
    let contribution = Contribution {
        tx_id: request.tx_id,
        contributor: request.contributor,
        amount: request.amount,
        timestamp: request
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
    };
    match state.orchestrator.record_contribution(contribution).await {
        Ok(outcome) => (StatusCode::CREATED, Json::<ContributionOutcome>(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Collaborators;
    use crate::registry::Registry;
    use crate::test_support::{orchestrator_settings, MockChain, MockCompiler, MockSigner, SourceDir};

    async fn state(sources: &SourceDir) -> Arc<ApiState> {
        let registry = Registry::from_contracts(vec![
            sources.contract("all-traits", Category::Base),
            sources
                .contract("protocol-core", Category::Core)
                .with_deps(["all-traits"]),
        ])
        .unwrap();
        let orchestrator = Orchestrator::load(
            registry,
            Collaborators {
                chain: Arc::new(MockChain::default()),
                signer: Arc::new(MockSigner::default()),
                compiler: Arc::new(MockCompiler::default()),
            },
            db::init_pool("sqlite::memory:").await.unwrap(),
            orchestrator_settings(),
        )
        .await
        .unwrap();
        Arc::new(ApiState {
            orchestrator: Arc::new(orchestrator),
        })
    }

    fn request(tx_id: &str, amount: u64) -> ContributionRequest {
        ContributionRequest {
            tx_id: tx_id.to_string(),
            amount,
            contributor: None,
            timestamp: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn contribution_endpoint_advances_phase() {
        let sources = SourceDir::new();
        let state = state(&sources).await;

        let response = post_contribution(State(state.clone()), Json(request("0xabc", 10_000_000_000))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let Json(funding) = get_funding(State(state.clone())).await;
        assert_eq!(funding.phase, crate::funding::Phase::Core);

        let Json(plan) = get_plan(State(state)).await;
        assert_eq!(plan.order, vec!["all-traits", "protocol-core"]);
        assert_eq!(plan.schedule.batches, vec![vec!["all-traits"], vec!["protocol-core"]]);
    }

    #[tokio::test]
    async fn invalid_contribution_is_unprocessable() {
        let sources = SourceDir::new();
        let state = state(&sources).await;
        let response = post_contribution(State(state.clone()), Json(request("0xabc", 0))).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = get_all_events(State(state), Query(EventsQuery { after: None })).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
