mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use tco_core::{AllocationPolicy, AllocationReport};
use tower_http::trace::TraceLayer;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::db::Database;

pub use middleware::SecurityConfig;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// Allocation reports keyed by policy. Every write handler invalidates it.
    pub reports: QueryCache<Arc<AllocationReport>>,
    pub default_policy: AllocationPolicy,
}

impl AppState {
    pub fn new(db: Database, config: &Config) -> Self {
        Self {
            db,
            reports: QueryCache::new(config.cache_ttl),
            default_policy: config.allocation_policy,
        }
    }
}

pub fn create_router(state: AppState, security: SecurityConfig) -> Router {
    let api = Router::new()
        // Programs
        .route("/programs", get(handlers::list_programs))
        .route("/programs", post(handlers::create_program))
        .route("/programs/{id}", get(handlers::get_program))
        .route("/programs/{id}", put(handlers::update_program))
        .route("/programs/{id}", delete(handlers::delete_program))
        // Teams and rates
        .route("/teams", get(handlers::list_teams))
        .route("/teams", post(handlers::create_team))
        .route("/teams/{id}", get(handlers::get_team))
        .route("/teams/{id}", put(handlers::update_team))
        .route("/teams/{id}", delete(handlers::delete_team))
        .route("/teams/{id}/rates", get(handlers::get_team_rate))
        .route("/teams/{id}/rates", put(handlers::upsert_team_rate))
        .route("/rates", get(handlers::list_team_rates))
        // Vendors
        .route("/vendors", get(handlers::list_vendors))
        .route("/vendors", post(handlers::create_vendor))
        .route("/vendors/{id}", get(handlers::get_vendor))
        .route("/vendors/{id}", put(handlers::update_vendor))
        .route("/vendors/{id}", delete(handlers::delete_vendor))
        // Application groups
        .route("/groups", get(handlers::list_groups))
        .route("/groups", post(handlers::create_group))
        .route("/groups/{id}", get(handlers::get_group))
        .route("/groups/{id}", put(handlers::update_group))
        .route("/groups/{id}", delete(handlers::delete_group))
        // Applications
        .route("/applications", get(handlers::list_applications))
        .route("/applications", post(handlers::create_application))
        .route("/applications/{id}", get(handlers::get_application))
        .route("/applications/{id}", put(handlers::update_application))
        .route("/applications/{id}", delete(handlers::delete_application))
        // Invoices and rollover
        .route("/invoices", get(handlers::list_invoices))
        .route("/invoices", post(handlers::create_invoice))
        .route("/invoices/{id}", get(handlers::get_invoice))
        .route("/invoices/{id}", put(handlers::update_invoice))
        .route("/invoices/{id}", delete(handlers::delete_invoice))
        .route("/rollovers", get(handlers::list_rollovers))
        .route("/rollovers", post(handlers::rollover))
        .route("/rollovers/{batch_id}", delete(handlers::rollback))
        // ADO features
        .route("/ado/features", get(handlers::list_ado_features))
        .route("/ado/features", post(handlers::upsert_ado_features))
        .route("/ado/import", post(handlers::import_ado_export))
        .route("/ado/teams", get(handlers::list_ado_teams))
        .route("/ado/apps", get(handlers::list_ado_apps))
        .route("/ado/unmapped/teams", get(handlers::list_unmapped_teams))
        .route("/ado/unmapped/apps", get(handlers::list_unmapped_apps))
        .route("/ado/explorer/periods", get(handlers::effort_by_period))
        .route("/ado/explorer/teams", get(handlers::effort_by_team))
        .route("/ado/reset", post(handlers::reset_ado))
        // Label mappings
        .route("/mappings/teams", get(handlers::list_team_mappings))
        .route("/mappings/teams", put(handlers::upsert_team_mapping))
        .route("/mappings/apps", get(handlers::list_app_mappings))
        .route("/mappings/apps", put(handlers::upsert_app_mapping))
        // Costs
        .route("/costs", get(handlers::get_cost_report))
        .route("/costs/features", get(handlers::list_feature_costs))
        .route("/costs/cohorts", get(handlers::list_cohorts))
        .route("/costs/unmapped", get(handlers::list_unmapped_features))
        .route("/costs/components", get(handlers::list_cost_components))
        .route("/cache/refresh", post(handlers::refresh_cache))
        // Health
        .route("/health", get(handlers::health));

    let mut router = Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(from_fn_with_state(
            security.clone(),
            middleware::auth_middleware,
        ));

    if let Some(limiter) = security.rate_limiter.clone() {
        router = router.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(security.cors_layer())
}
