use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tco_core::{
    AllocationPolicy, AllocationReport, CohortSummary, ComponentFilter, CostComponents,
    FeatureCost, FeatureRecord, UnmappedFeature,
};
use uuid::Uuid;

use super::AppState;
use crate::error::TcoError;
use crate::ingest::{self, ImportReport, IngestOptions};
use crate::models::*;

type ApiError = (StatusCode, String);

// ============================================================
// Error Handling
// ============================================================

/// Map a failure to a status code.
///
/// Domain errors are returned to the client as-is. Anything else is logged
/// and answered with a generic message so internals do not leak.
fn api_error(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<TcoError>() {
        Some(err @ (TcoError::Validation(_) | TcoError::Parse { .. })) => {
            tracing::warn!("Validation error: {}", err);
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        Some(err @ (TcoError::Conflict(_) | TcoError::InUse { .. })) => {
            tracing::warn!("Conflict: {}", err);
            (StatusCode::CONFLICT, err.to_string())
        }
        Some(err @ TcoError::NotFound(_)) => (StatusCode::NOT_FOUND, err.to_string()),
        None => {
            tracing::error!("Internal error: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn not_found(what: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{} not found", what))
}

fn deleted(found: bool, what: &str) -> Result<StatusCode, ApiError> {
    if found {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(what))
    }
}

impl AppState {
    /// Drop cached reports after a successful write.
    fn written<T>(&self, value: T) -> T {
        self.reports.invalidate();
        value
    }
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Programs
// ============================================================

pub async fn list_programs(State(state): State<AppState>) -> Result<Json<Vec<Program>>, ApiError> {
    state.db.get_all_programs().map(Json).map_err(api_error)
}

pub async fn get_program(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Program>, ApiError> {
    state
        .db
        .get_program(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Program"))
}

pub async fn create_program(
    State(state): State<AppState>,
    Json(input): Json<CreateProgramInput>,
) -> Result<(StatusCode, Json<Program>), ApiError> {
    state
        .db
        .create_program(input)
        .map(|p| (StatusCode::CREATED, Json(state.written(p))))
        .map_err(api_error)
}

pub async fn update_program(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateProgramInput>,
) -> Result<Json<Program>, ApiError> {
    state
        .db
        .update_program(id, input)
        .map_err(api_error)?
        .map(|p| Json(state.written(p)))
        .ok_or_else(|| not_found("Program"))
}

pub async fn delete_program(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_program(id).map_err(api_error)?;
    deleted(state.written(found), "Program")
}

// ============================================================
// Teams
// ============================================================

pub async fn list_teams(State(state): State<AppState>) -> Result<Json<Vec<Team>>, ApiError> {
    state.db.get_all_teams().map(Json).map_err(api_error)
}

pub async fn get_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Team>, ApiError> {
    state
        .db
        .get_team(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Team"))
}

pub async fn create_team(
    State(state): State<AppState>,
    Json(input): Json<CreateTeamInput>,
) -> Result<(StatusCode, Json<Team>), ApiError> {
    state
        .db
        .create_team(input)
        .map(|t| (StatusCode::CREATED, Json(state.written(t))))
        .map_err(api_error)
}

pub async fn update_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateTeamInput>,
) -> Result<Json<Team>, ApiError> {
    state
        .db
        .update_team(id, input)
        .map_err(api_error)?
        .map(|t| Json(state.written(t)))
        .ok_or_else(|| not_found("Team"))
}

pub async fn delete_team(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_team(id).map_err(api_error)?;
    deleted(state.written(found), "Team")
}

// ============================================================
// Team rates
// ============================================================

pub async fn list_team_rates(
    State(state): State<AppState>,
) -> Result<Json<Vec<TeamRate>>, ApiError> {
    state.db.get_team_rates().map(Json).map_err(api_error)
}

pub async fn get_team_rate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TeamRate>, ApiError> {
    state
        .db
        .get_team_rate(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Team rate"))
}

pub async fn upsert_team_rate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpsertTeamRateInput>,
) -> Result<Json<TeamRate>, ApiError> {
    state
        .db
        .upsert_team_rate(id, input)
        .map_err(api_error)?
        .map(|r| Json(state.written(r)))
        .ok_or_else(|| not_found("Team"))
}

// ============================================================
// Vendors
// ============================================================

pub async fn list_vendors(State(state): State<AppState>) -> Result<Json<Vec<Vendor>>, ApiError> {
    state.db.get_all_vendors().map(Json).map_err(api_error)
}

pub async fn get_vendor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vendor>, ApiError> {
    state
        .db
        .get_vendor(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Vendor"))
}

pub async fn create_vendor(
    State(state): State<AppState>,
    Json(input): Json<CreateVendorInput>,
) -> Result<(StatusCode, Json<Vendor>), ApiError> {
    state
        .db
        .create_vendor(input)
        .map(|v| (StatusCode::CREATED, Json(state.written(v))))
        .map_err(api_error)
}

pub async fn update_vendor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateVendorInput>,
) -> Result<Json<Vendor>, ApiError> {
    state
        .db
        .update_vendor(id, input)
        .map_err(api_error)?
        .map(|v| Json(state.written(v)))
        .ok_or_else(|| not_found("Vendor"))
}

pub async fn delete_vendor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_vendor(id).map_err(api_error)?;
    deleted(state.written(found), "Vendor")
}

// ============================================================
// Application groups
// ============================================================

pub async fn list_groups(
    State(state): State<AppState>,
) -> Result<Json<Vec<ApplicationGroup>>, ApiError> {
    state
        .db
        .get_all_application_groups()
        .map(Json)
        .map_err(api_error)
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApplicationGroup>, ApiError> {
    state
        .db
        .get_application_group(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Application group"))
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(input): Json<CreateApplicationGroupInput>,
) -> Result<(StatusCode, Json<ApplicationGroup>), ApiError> {
    state
        .db
        .create_application_group(input)
        .map(|g| (StatusCode::CREATED, Json(state.written(g))))
        .map_err(api_error)
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateApplicationGroupInput>,
) -> Result<Json<ApplicationGroup>, ApiError> {
    state
        .db
        .update_application_group(id, input)
        .map_err(api_error)?
        .map(|g| Json(state.written(g)))
        .ok_or_else(|| not_found("Application group"))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_application_group(id).map_err(api_error)?;
    deleted(state.written(found), "Application group")
}

// ============================================================
// Applications
// ============================================================

pub async fn list_applications(
    State(state): State<AppState>,
) -> Result<Json<Vec<Application>>, ApiError> {
    state.db.get_all_applications().map(Json).map_err(api_error)
}

pub async fn get_application(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Application>, ApiError> {
    state
        .db
        .get_application(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Application"))
}

pub async fn create_application(
    State(state): State<AppState>,
    Json(input): Json<CreateApplicationInput>,
) -> Result<(StatusCode, Json<Application>), ApiError> {
    state
        .db
        .create_application(input)
        .map(|a| (StatusCode::CREATED, Json(state.written(a))))
        .map_err(api_error)
}

pub async fn update_application(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateApplicationInput>,
) -> Result<Json<Application>, ApiError> {
    state
        .db
        .update_application(id, input)
        .map_err(api_error)?
        .map(|a| Json(state.written(a)))
        .ok_or_else(|| not_found("Application"))
}

pub async fn delete_application(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_application(id).map_err(api_error)?;
    deleted(state.written(found), "Application")
}

// ============================================================
// Invoices
// ============================================================

pub async fn list_invoices(
    State(state): State<AppState>,
    Query(filter): Query<InvoiceFilter>,
) -> Result<Json<Vec<Invoice>>, ApiError> {
    state.db.list_invoices(&filter).map(Json).map_err(api_error)
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Invoice>, ApiError> {
    state
        .db
        .get_invoice(id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("Invoice"))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Json(input): Json<CreateInvoiceInput>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    state
        .db
        .create_invoice(input)
        .map(|i| (StatusCode::CREATED, Json(state.written(i))))
        .map_err(api_error)
}

pub async fn update_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateInvoiceInput>,
) -> Result<Json<Invoice>, ApiError> {
    state
        .db
        .update_invoice(id, input)
        .map_err(api_error)?
        .map(|i| Json(state.written(i)))
        .ok_or_else(|| not_found("Invoice"))
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let found = state.db.delete_invoice(id).map_err(api_error)?;
    deleted(state.written(found), "Invoice")
}

// ============================================================
// Rollover
// ============================================================

pub async fn rollover(
    State(state): State<AppState>,
    Json(input): Json<RolloverInput>,
) -> Result<(StatusCode, Json<RolloverResult>), ApiError> {
    state
        .db
        .rollover_invoices(input)
        .map(|r| (StatusCode::CREATED, Json(state.written(r))))
        .map_err(api_error)
}

pub async fn list_rollovers(
    State(state): State<AppState>,
) -> Result<Json<Vec<RolloverLogEntry>>, ApiError> {
    state.db.get_rollover_log().map(Json).map_err(api_error)
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<RollbackResult>, ApiError> {
    state
        .db
        .rollback_rollover(batch_id)
        .map(|r| Json(state.written(r)))
        .map_err(api_error)
}

// ============================================================
// ADO features
// ============================================================

pub async fn list_ado_features(
    State(state): State<AppState>,
) -> Result<Json<Vec<FeatureRecord>>, ApiError> {
    state.db.get_ado_features().map(Json).map_err(api_error)
}

pub async fn upsert_ado_features(
    State(state): State<AppState>,
    Json(features): Json<Vec<FeatureRecord>>,
) -> Result<Json<UpsertSummary>, ApiError> {
    state
        .db
        .upsert_ado_features(&features)
        .map(|s| Json(state.written(s)))
        .map_err(api_error)
}

/// Raw export bytes in the body; `?file_name=` and `?comma_decimal=` in the query.
pub async fn import_ado_export(
    State(state): State<AppState>,
    Query(options): Query<IngestOptions>,
    body: Bytes,
) -> Result<Json<ImportReport>, ApiError> {
    ingest::import_ado_export(&state.db, &body, &options)
        .map(|r| Json(state.written(r)))
        .map_err(api_error)
}

pub async fn list_ado_teams(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state.db.distinct_team_labels().map(Json).map_err(api_error)
}

pub async fn list_ado_apps(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state.db.distinct_app_labels().map(Json).map_err(api_error)
}

pub async fn list_unmapped_teams(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    state.db.unmapped_team_labels().map(Json).map_err(api_error)
}

pub async fn list_unmapped_apps(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ApiError> {
    state.db.unmapped_app_labels().map(Json).map_err(api_error)
}

pub async fn effort_by_period(
    State(state): State<AppState>,
) -> Result<Json<Vec<PeriodEffort>>, ApiError> {
    state.db.effort_by_period().map(Json).map_err(api_error)
}

pub async fn effort_by_team(
    State(state): State<AppState>,
) -> Result<Json<Vec<TeamEffort>>, ApiError> {
    state.db.effort_by_team().map(Json).map_err(api_error)
}

pub async fn reset_ado(
    State(state): State<AppState>,
    Json(input): Json<ResetAdoInput>,
) -> Result<Json<ResetSummary>, ApiError> {
    state
        .db
        .reset_ado(input.include_mappings)
        .map(|s| Json(state.written(s)))
        .map_err(api_error)
}

// ============================================================
// Mappings
// ============================================================

pub async fn list_team_mappings(
    State(state): State<AppState>,
) -> Result<Json<Vec<TeamMapping>>, ApiError> {
    state.db.get_team_mappings().map(Json).map_err(api_error)
}

/// 200 with the stored mapping, or 204 when a null target removed it.
pub async fn upsert_team_mapping(
    State(state): State<AppState>,
    Json(input): Json<UpsertTeamMappingInput>,
) -> Result<Response, ApiError> {
    let mapping = state.db.upsert_team_mapping(input).map_err(api_error)?;
    Ok(match state.written(mapping) {
        Some(m) => Json(m).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn list_app_mappings(
    State(state): State<AppState>,
) -> Result<Json<Vec<AppMapping>>, ApiError> {
    state.db.get_app_mappings().map(Json).map_err(api_error)
}

pub async fn upsert_app_mapping(
    State(state): State<AppState>,
    Json(input): Json<UpsertAppMappingInput>,
) -> Result<Response, ApiError> {
    let mapping = state.db.upsert_app_mapping(input).map_err(api_error)?;
    Ok(match state.written(mapping) {
        Some(m) => Json(m).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// ============================================================
// Costs
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    /// Overrides the configured allocation policy.
    pub policy: Option<String>,
}

fn allocation_report(
    state: &AppState,
    query: &CostQuery,
) -> Result<Arc<AllocationReport>, ApiError> {
    let policy = match query.policy.as_deref() {
        Some(raw) => raw
            .parse::<AllocationPolicy>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => state.default_policy,
    };

    state
        .reports
        .get_or_try_insert_with(policy.as_str(), || {
            state.db.compute_allocation(policy).map(Arc::new)
        })
        .map_err(api_error)
}

pub async fn get_cost_report(
    State(state): State<AppState>,
    Query(query): Query<CostQuery>,
) -> Result<Json<AllocationReport>, ApiError> {
    let report = allocation_report(&state, &query)?;
    Ok(Json(report.as_ref().clone()))
}

pub async fn list_feature_costs(
    State(state): State<AppState>,
    Query(query): Query<CostQuery>,
) -> Result<Json<Vec<FeatureCost>>, ApiError> {
    let report = allocation_report(&state, &query)?;
    Ok(Json(report.features.clone()))
}

pub async fn list_cohorts(
    State(state): State<AppState>,
    Query(query): Query<CostQuery>,
) -> Result<Json<Vec<CohortSummary>>, ApiError> {
    let report = allocation_report(&state, &query)?;
    Ok(Json(report.cohorts.clone()))
}

pub async fn list_unmapped_features(
    State(state): State<AppState>,
    Query(query): Query<CostQuery>,
) -> Result<Json<Vec<UnmappedFeature>>, ApiError> {
    let report = allocation_report(&state, &query)?;
    Ok(Json(report.unmapped.clone()))
}

/// Filters for the component report. Each value is a comma separated list.
#[derive(Debug, Default, Deserialize)]
pub struct ComponentQuery {
    pub policy: Option<String>,
    pub year: Option<String>,
    pub pi: Option<String>,
    pub program_id: Option<String>,
    pub team_id: Option<String>,
    pub group_id: Option<String>,
}

fn parse_list<T: std::str::FromStr>(raw: Option<&str>, field: &str) -> Result<Vec<T>, ApiError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse().map_err(|_| {
                (
                    StatusCode::BAD_REQUEST,
                    format!("Invalid {} filter value '{}'", field, v),
                )
            })
        })
        .collect()
}

pub async fn list_cost_components(
    State(state): State<AppState>,
    Query(query): Query<ComponentQuery>,
) -> Result<Json<Vec<CostComponents>>, ApiError> {
    let filter = ComponentFilter {
        years: parse_list(query.year.as_deref(), "year")?,
        iterations: parse_list(query.pi.as_deref(), "pi")?,
        program_ids: parse_list(query.program_id.as_deref(), "program_id")?,
        team_ids: parse_list(query.team_id.as_deref(), "team_id")?,
        group_ids: parse_list(query.group_id.as_deref(), "group_id")?,
    };
    let report = allocation_report(
        &state,
        &CostQuery {
            policy: query.policy,
        },
    )?;
    Ok(Json(tco_core::cost_components(&report.features, &filter)))
}

pub async fn refresh_cache(State(state): State<AppState>) -> impl IntoResponse {
    let version = state.reports.invalidate();
    Json(serde_json::json!({ "version": version }))
}
