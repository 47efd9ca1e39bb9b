//! HTTP routes

pub mod account;
#[cfg(feature = "billing")]
pub mod billing;
pub mod health;
pub mod sync_admin;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Health and webhook intake stay outside the auth middleware.
    // Webhook callers authenticate by signature, not by session.
    let public = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/webhooks/identity",
            post(webhooks::receive_identity_webhook),
        );

    #[cfg(feature = "billing")]
    let public = public.route("/webhooks/stripe", post(webhooks::receive_stripe_webhook));

    let admin = Router::new()
        .route("/sync/records", get(sync_admin::list_sync_records))
        .route("/sync/stats", get(sync_admin::sync_stats))
        .route("/dead-letters", get(sync_admin::list_dead_letters))
        .route(
            "/dead-letters/{id}/retry",
            post(sync_admin::retry_dead_letter),
        )
        .route(
            "/dead-letters/{id}/resolve",
            post(sync_admin::resolve_dead_letter),
        )
        .route(
            "/dead-letters/retry-all",
            post(sync_admin::retry_all_dead_letters),
        )
        .route("/invariants", get(sync_admin::run_invariant_checks));

    let account = Router::new()
        .route("/deletion-check", get(account::deletion_check))
        .route("/", delete(account::delete_account));

    let authed = Router::new()
        .nest("/api/v1/admin", admin)
        .nest("/api/v1/account", account);

    #[cfg(feature = "billing")]
    let authed = authed
        .route("/api/v1/billing/checkout", post(billing::create_checkout))
        .route("/api/v1/billing/portal", post(billing::create_portal));

    let authed = authed.route_layer(middleware::from_fn_with_state(
        state.auth_state(),
        require_auth,
    ));

    public.merge(authed).with_state(state)
}
