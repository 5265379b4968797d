use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::warn;
use uuid::Uuid;

use customer_svc_core::{CreateCustomerRequest, Customer, UpdateCustomerRequest};

use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::service::{CustomerServiceError, PageRequest};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

pub async fn create_customer(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Customer>), ProblemResponse> {
    let request: CreateCustomerRequest = decode_body(&body)?;
    let customer = state.customers().create_customer(&request).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

/// Lists customers; paging applies only when `limit` or `offset` is supplied.
pub async fn list_customers(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Customer>>, ProblemResponse> {
    let Query(query) = query.map_err(|err| {
        ProblemResponse::bad_request("invalid_query", format!("invalid query parameters: {err}"))
    })?;

    let customers = if query.limit.is_none() && query.offset.is_none() {
        state.customers().get_all_customers().await?
    } else {
        let page = PageRequest::new(query.limit, query.offset)
            .map_err(|err| ProblemResponse::bad_request("validation_failed", err.message()))?;
        state.customers().list_customers(page).await?
    };

    Ok(Json(customers))
}

pub async fn get_customer(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Customer>, ProblemResponse> {
    let id = parse_customer_id(&raw_id)?;
    let customer = state.customers().get_customer(id).await?;
    Ok(Json(customer))
}

/// Resolves the customer profile owned by an external user identity.
pub async fn get_customer_by_user(
    State(state): State<AppState>,
    Path(raw_user_id): Path<String>,
) -> Result<Json<Customer>, ProblemResponse> {
    let user_id = Uuid::parse_str(&raw_user_id).map_err(|err| {
        warn!(stage = "http", user_id = %raw_user_id, error = %err, "invalid user id");
        ProblemResponse::bad_request("invalid_user_id", "invalid user id")
    })?;
    let customer = state.customers().get_customer_by_user(user_id).await?;
    Ok(Json(customer))
}

pub async fn update_customer(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    body: Bytes,
) -> Result<Json<Customer>, ProblemResponse> {
    let id = parse_customer_id(&raw_id)?;
    let request: UpdateCustomerRequest = decode_body(&body)?;
    let customer = state.customers().update_customer(id, &request).await?;
    Ok(Json(customer))
}

fn parse_customer_id(raw: &str) -> Result<Uuid, ProblemResponse> {
    Uuid::parse_str(raw).map_err(|err| {
        warn!(stage = "http", id = raw, error = %err, "invalid customer id");
        ProblemResponse::bad_request("invalid_customer_id", "invalid customer id")
    })
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProblemResponse> {
    serde_json::from_slice(body).map_err(|err| {
        warn!(stage = "http", error = %err, "failed to decode request body");
        ProblemResponse::bad_request("invalid_body", format!("invalid request body: {err}"))
    })
}

impl From<CustomerServiceError> for ProblemResponse {
    fn from(err: CustomerServiceError) -> Self {
        match err {
            CustomerServiceError::Validation(err) => {
                ProblemResponse::bad_request("validation_failed", err.message())
            }
            CustomerServiceError::NotFound => ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "customer_not_found",
                "customer not found",
            ),
            CustomerServiceError::Persistence(_) => ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "persistence_error",
                "failed to access customer storage",
            ),
        }
    }
}
