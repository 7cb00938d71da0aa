//! Router assembly: trace -> CORS -> auth, with per-handler role guards.
//!
//! Public routes (login, enrollment, health, Prometheus export, and the
//! boot-time service-tag lookup) bypass authentication. Everything else
//! sits behind [`auth::auth_required`]; operator/admin narrowing happens
//! through the [`auth::RequireOperator`]/[`auth::RequireAdmin`] guards in
//! the handlers. When authentication is disabled the same paths exist
//! without the auth layer and the guards pass everything through.

use axum::http::{header, Method};
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers::{
    self, bulk, groups, image_tests, machines, metrics, power, templates, users, webhooks,
};
use crate::prometheus;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/login", post(users::login))
        .route("/enroll", post(machines::enroll))
        .route(
            "/machines/by-servicetag/:service_tag",
            get(machines::get_by_service_tag),
        )
        .route("/health", get(handlers::health))
        .route("/metrics", get(prometheus::export));

    let authenticated = Router::new()
        .route("/auth/refresh", post(users::refresh))
        .route("/auth/me", get(users::me))
        .route(
            "/machines",
            get(machines::list),
        )
        .route(
            "/machines/:id",
            get(machines::get)
                .put(machines::update)
                .delete(machines::delete),
        )
        .route("/machines/:id/builds", get(machines::list_builds))
        .route("/machines/:id/groups", get(machines::list_groups))
        .route("/machines/:id/events", get(machines::list_events))
        .route("/events", get(machines::list_all_events))
        .route("/machines/:id/build", post(machines::request_build))
        .route("/machines/:id/metrics", post(metrics::submit))
        .route("/machines/:id/metrics/latest", get(metrics::latest))
        .route("/machines/:id/metrics/history", get(metrics::history))
        .route("/machines/:id/power", post(power::dispatch))
        .route("/machines/:id/power/status", get(power::status))
        .route("/machines/:id/power/operations", get(power::operations))
        .route("/machines/:id/bmc/test", post(power::test_bmc))
        .route("/machines/:id/bmc/info", get(power::bmc_info))
        .route("/machines/:id/bmc/sensors", get(power::sensors))
        .route(
            "/machines/:id/template/:template_id",
            post(templates::apply),
        )
        .route("/builds/:id", get(machines::get_build))
        .route("/groups", get(groups::list).post(groups::create))
        .route(
            "/groups/:id",
            get(groups::get).put(groups::update).delete(groups::delete),
        )
        .route("/groups/:id/machines", get(groups::list_machines))
        .route(
            "/groups/:id/machines/:machine_id",
            put(groups::add_machine).delete(groups::remove_machine),
        )
        .route("/bulk", post(bulk::execute))
        .route("/webhooks", get(webhooks::list).post(webhooks::create))
        .route(
            "/webhooks/:id",
            get(webhooks::get)
                .put(webhooks::update)
                .delete(webhooks::delete),
        )
        .route("/webhooks/:id/deliveries", get(webhooks::list_deliveries))
        .route("/templates", get(templates::list).post(templates::create))
        .route(
            "/templates/:id",
            get(templates::get)
                .put(templates::update)
                .delete(templates::delete),
        )
        .route(
            "/image-tests",
            get(image_tests::list).post(image_tests::create),
        )
        .route(
            "/image-tests/:id",
            get(image_tests::get).put(image_tests::update),
        )
        .route("/users", get(users::list).post(users::create))
        .route(
            "/users/:id",
            get(users::get).put(users::update).delete(users::delete),
        );

    let api = if state.config.enable_auth {
        public.merge(authenticated.layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_required,
        )))
    } else {
        public
            .merge(authenticated)
            .layer(middleware::from_fn_with_state(
                state.clone(),
                auth::optional_auth,
            ))
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handlers::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
