use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::MatchingError;
use crate::models::{
    AssignUserRequest, BulkAssignRequest, CreateGroupRequest, ErrorResponse, GroupView,
    HealthResponse, HistoryResponse, MoveUserRequest, MutationResponse, PreviewResponse,
    RemoveUserRequest, ResultsResponse, TriggerResponse,
};
use crate::services::{ManualOverrideService, MatchingCoordinator, MatchingRepository, TriggerOutcome};

/// Header carrying the acting admin, set by the upstream auth layer
pub const ADMIN_HEADER: &str = "X-Admin-Id";

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<MatchingCoordinator>,
    pub overrides: Arc<ManualOverrideService>,
    pub repository: Arc<dyn MatchingRepository>,
}

/// Configure all matching routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/events/{event_id}/matching")
            .route("/preview", web::post().to(preview))
            .route("/preview/{preview_id}", web::get().to(get_preview))
            .route("/trigger", web::post().to(trigger))
            .route("/invalidate", web::post().to(invalidate))
            .route("/results", web::get().to(results))
            .route("/history", web::get().to(history))
            .route("/assign", web::post().to(assign))
            .route("/move", web::post().to(move_user))
            .route("/remove", web::post().to(remove))
            .route("/groups", web::post().to(create_group))
            .route("/bulk-assign", web::post().to(bulk_assign)),
    );
}

impl From<TriggerOutcome> for TriggerResponse {
    fn from(outcome: TriggerOutcome) -> Self {
        Self {
            run: outcome.run,
            created: outcome.created,
            groups: outcome.groups.iter().map(GroupView::from).collect(),
            new_group_ids: outcome.new_group_ids,
            unassignable: outcome.unassignable,
        }
    }
}

fn admin_id(req: &HttpRequest) -> Result<String, HttpResponse> {
    req.headers()
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            HttpResponse::Unauthorized().json(ErrorResponse {
                error: "Unauthorized".to_string(),
                message: format!("missing {} header", ADMIN_HEADER),
                status_code: 401,
            })
        })
}

fn validation_failed(errors: validator::ValidationErrors) -> HttpResponse {
    tracing::info!("Validation failed: field_errors={:?}", errors);
    HttpResponse::BadRequest().json(ErrorResponse {
        error: "Validation failed".to_string(),
        message: errors.to_string(),
        status_code: 400,
    })
}

fn mutation_response(result: Result<Vec<crate::models::MatchingGroup>, MatchingError>) -> HttpResponse {
    match result {
        Ok(groups) => HttpResponse::Ok().json(MutationResponse {
            groups: groups.iter().map(GroupView::from).collect(),
        }),
        Err(e) => e.error_response(),
    }
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let healthy = state.repository.health_check().await.unwrap_or(false);

    let status = if healthy { "healthy" } else { "degraded" };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// POST /api/v1/events/{event_id}/matching/preview
///
/// Allocates the current pool without persisting anything.
async fn preview(
    state: web::Data<AppState>,
    path: web::Path<String>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    let event_id = path.into_inner();

    tracing::info!("Preview requested for event {} by {}", event_id, actor);

    match state.coordinator.preview_matching(&event_id, &actor).await {
        Ok(snapshot) => HttpResponse::Ok().json(PreviewResponse::from(snapshot)),
        Err(e) => e.error_response(),
    }
}

/// GET /api/v1/events/{event_id}/matching/preview/{preview_id}
async fn get_preview(
    state: web::Data<AppState>,
    path: web::Path<(String, Uuid)>,
) -> impl Responder {
    let (event_id, preview_id) = path.into_inner();

    match state.coordinator.get_preview(&event_id, preview_id).await {
        Ok(snapshot) => HttpResponse::Ok().json(PreviewResponse::from(snapshot)),
        Err(e) => e.error_response(),
    }
}

/// POST /api/v1/events/{event_id}/matching/trigger
///
/// Commits groups for newly eligible participants. Concurrent triggers for
/// the same event get 409.
async fn trigger(
    state: web::Data<AppState>,
    path: web::Path<String>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    let event_id = path.into_inner();

    tracing::info!("Trigger requested for event {} by {}", event_id, actor);

    match state.coordinator.trigger_matching(&event_id, &actor).await {
        Ok(outcome) => HttpResponse::Ok().json(TriggerResponse::from(outcome)),
        Err(e) => e.error_response(),
    }
}

/// POST /api/v1/events/{event_id}/matching/invalidate
async fn invalidate(
    state: web::Data<AppState>,
    path: web::Path<String>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    let event_id = path.into_inner();

    match state.coordinator.invalidate_run(&event_id, &actor).await {
        Ok(run) => HttpResponse::Ok().json(run),
        Err(e) => e.error_response(),
    }
}

/// GET /api/v1/events/{event_id}/matching/results
async fn results(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let event_id = path.into_inner();

    match state.coordinator.results(&event_id).await {
        Ok((run, groups)) => HttpResponse::Ok().json(ResultsResponse {
            run,
            groups: groups.iter().map(GroupView::from).collect(),
        }),
        Err(e) => e.error_response(),
    }
}

/// GET /api/v1/events/{event_id}/matching/history
async fn history(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let event_id = path.into_inner();

    match state.coordinator.history(&event_id).await {
        Ok((runs, audit_entries)) => HttpResponse::Ok().json(HistoryResponse {
            event_id,
            runs,
            audit_entries,
        }),
        Err(e) => e.error_response(),
    }
}

/// POST /api/v1/events/{event_id}/matching/assign
///
/// Request body:
/// ```json
/// { "userId": "string", "groupId": "uuid", "expectedVersion": 3 }
/// ```
async fn assign(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<AssignUserRequest>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    mutation_response(
        state
            .overrides
            .assign_user_to_group(&path.into_inner(), &actor, &req)
            .await,
    )
}

/// POST /api/v1/events/{event_id}/matching/move
async fn move_user(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<MoveUserRequest>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    mutation_response(
        state
            .overrides
            .move_user_between_groups(&path.into_inner(), &actor, &req)
            .await,
    )
}

/// POST /api/v1/events/{event_id}/matching/remove
async fn remove(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<RemoveUserRequest>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    mutation_response(
        state
            .overrides
            .remove_user_from_group(&path.into_inner(), &actor, &req)
            .await,
    )
}

/// POST /api/v1/events/{event_id}/matching/groups
async fn create_group(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<CreateGroupRequest>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    mutation_response(
        state
            .overrides
            .create_manual_group(&path.into_inner(), &actor, &req)
            .await,
    )
}

/// POST /api/v1/events/{event_id}/matching/bulk-assign
///
/// Always 200 once the body is valid; per-item outcomes are in `results`.
async fn bulk_assign(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<BulkAssignRequest>,
    http_req: HttpRequest,
) -> impl Responder {
    let actor = match admin_id(&http_req) {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    if let Err(errors) = req.validate() {
        return validation_failed(errors);
    }

    let response = state
        .overrides
        .bulk_assign_users(&path.into_inner(), &actor, &req)
        .await;

    HttpResponse::Ok().json(response)
}
