use std::{sync::Arc, time::Instant};

use chrono::{DateTime, SubsecRound, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use customer_svc_core::{
    validate_create, validate_update, CreateCustomerRequest, Customer, UpdateCustomerRequest,
    ValidationError,
};
use customer_svc_storage::{CustomerRepositoryError, Database};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Offset/limit window over the customer listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub offset: u32,
}

impl PageRequest {
    /// Resolves optional query values, applying [`DEFAULT_PAGE_LIMIT`] when `limit` is absent.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Result<Self, ValidationError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::new(
                "limit",
                format!("limit must be between 1 and {MAX_PAGE_LIMIT}"),
            ));
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }
}

/// Orchestrates validation and persistence for customers. Owns every business rule.
#[derive(Clone)]
pub struct CustomerService {
    database: Database,
    clock: Clock,
}

impl CustomerService {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    /// Current time at the precision the store keeps, so returned records match stored ones.
    fn now(&self) -> DateTime<Utc> {
        (self.clock)().trunc_subsecs(3)
    }

    pub async fn create_customer(
        &self,
        request: &CreateCustomerRequest,
    ) -> Result<Customer, CustomerServiceError> {
        let started = Instant::now();
        let result = self.create_inner(request).await;
        record_outcome("create", started, &result);
        result
    }

    async fn create_inner(
        &self,
        request: &CreateCustomerRequest,
    ) -> Result<Customer, CustomerServiceError> {
        let now = self.now();
        let draft = validate_create(request, now.date_naive()).map_err(|err| {
            warn!(stage = "customer", op = "create", field = err.field(), error = %err, "validation failed");
            err
        })?;

        let customer = draft.into_customer(Uuid::new_v4(), now);
        self.database
            .customers()
            .create(&customer)
            .await
            .map_err(|err| {
                error!(stage = "customer", op = "create", error = %err, "failed to create customer");
                CustomerServiceError::Persistence(err)
            })?;

        info!(stage = "customer", op = "create", customer_id = %customer.id, user_id = %customer.user_id, "customer created");
        Ok(customer)
    }

    pub async fn get_customer(&self, id: Uuid) -> Result<Customer, CustomerServiceError> {
        let started = Instant::now();
        let result = self
            .database
            .customers()
            .get_by_id(id)
            .await
            .map_err(|err| log_lookup_failure("get", id, err));
        record_outcome("get", started, &result);
        result
    }

    /// Looks up the customer profile linked to an owning user.
    pub async fn get_customer_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Customer, CustomerServiceError> {
        let started = Instant::now();
        let result = self
            .database
            .customers()
            .get_by_user_id(user_id)
            .await
            .map_err(|err| log_lookup_failure("get_by_user", user_id, err));
        record_outcome("get_by_user", started, &result);
        result
    }

    /// Returns every customer. Prefer [`Self::list_customers`] for large tables.
    pub async fn get_all_customers(&self) -> Result<Vec<Customer>, CustomerServiceError> {
        let started = Instant::now();
        let result = self.database.customers().get_all().await.map_err(|err| {
            error!(stage = "customer", op = "list", error = %err, "failed to list customers");
            CustomerServiceError::from(err)
        });
        if let Ok(customers) = &result {
            info!(stage = "customer", op = "list", count = customers.len(), "customers retrieved");
        }
        record_outcome("list", started, &result);
        result
    }

    pub async fn list_customers(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Customer>, CustomerServiceError> {
        let started = Instant::now();
        let result = self
            .database
            .customers()
            .list_page(page.limit, page.offset)
            .await
            .map_err(|err| {
                error!(stage = "customer", op = "list_page", limit = page.limit, offset = page.offset, error = %err, "failed to list customers");
                CustomerServiceError::from(err)
            });
        record_outcome("list_page", started, &result);
        result
    }

    /// Applies a partial update in a single statement; absent fields are left untouched.
    pub async fn update_customer(
        &self,
        id: Uuid,
        request: &UpdateCustomerRequest,
    ) -> Result<Customer, CustomerServiceError> {
        let started = Instant::now();
        let result = self.update_inner(id, request).await;
        record_outcome("update", started, &result);
        result
    }

    async fn update_inner(
        &self,
        id: Uuid,
        request: &UpdateCustomerRequest,
    ) -> Result<Customer, CustomerServiceError> {
        let changes = validate_update(request, self.now().date_naive()).map_err(|err| {
            warn!(stage = "customer", op = "update", customer_id = %id, field = err.field(), error = %err, "validation failed");
            err
        })?;

        let customer = self
            .database
            .customers()
            .apply_changes(id, &changes)
            .await
            .map_err(|err| log_lookup_failure("update", id, err))?;

        info!(stage = "customer", op = "update", customer_id = %id, "customer updated");
        Ok(customer)
    }
}

fn log_lookup_failure(
    op: &'static str,
    id: Uuid,
    err: CustomerRepositoryError,
) -> CustomerServiceError {
    if err.is_not_found() {
        warn!(stage = "customer", op, %id, "customer not found");
    } else {
        error!(stage = "customer", op, %id, error = %err, "customer store call failed");
    }
    err.into()
}

fn record_outcome<T>(op: &'static str, started: Instant, result: &Result<T, CustomerServiceError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => err.metric_label(),
    };
    counter!("customer_operations_total", "op" => op, "result" => outcome).increment(1);
    histogram!("customer_operation_seconds", "op" => op).record(started.elapsed().as_secs_f64());
}

/// Failures surfaced by [`CustomerService`].
#[derive(Debug, Error)]
pub enum CustomerServiceError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("customer not found")]
    NotFound,
    #[error("persistence failure: {0}")]
    Persistence(CustomerRepositoryError),
}

impl CustomerServiceError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid",
            Self::NotFound => "not_found",
            Self::Persistence(_) => "error",
        }
    }
}

impl From<CustomerRepositoryError> for CustomerServiceError {
    fn from(err: CustomerRepositoryError) -> Self {
        match err {
            CustomerRepositoryError::NotFound => Self::NotFound,
            other => Self::Persistence(other),
        }
    }
}
