use std::{any::Any, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use customer_svc_storage::Database;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{error, info_span, Level, Span};

use crate::customers;
use crate::problem::ProblemResponse;
use crate::service::{Clock, CustomerService};
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    customers: CustomerService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, database: Database) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        Self::with_clock(metrics, database, clock)
    }

    pub fn with_clock(metrics: PrometheusHandle, database: Database, clock: Clock) -> Self {
        Self {
            metrics,
            customers: CustomerService::new(database, clock),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn customers(&self) -> &CustomerService {
        &self.customers
    }
}

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn app_router(state: AppState, request_timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/api/v1/customers",
            get(customers::list_customers).post(customers::create_customer),
        )
        .route(
            "/api/v1/customers/:id",
            get(customers::get_customer).put(customers::update_customer),
        )
        .route(
            "/api/v1/users/:user_id/customer",
            get(customers::get_customer_by_user),
        )
        .with_state(state);
    with_http_layers(routes, request_timeout)
}

/// Outermost first: request id, access log, id echo, panic guard, timeout.
fn with_http_layers(router: Router, request_timeout: Duration) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(request_span)
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(TimeoutLayer::new(request_timeout)),
    )
}

fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-");
    info_span!(
        "http_request",
        stage = "http",
        method = %request.method(),
        uri = %request.uri(),
        request_id,
    )
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(stage = "http", panic = detail, "request handler panicked");
    ProblemResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "internal server error",
    )
    .into_response()
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}
