use std::{str::FromStr, time::Duration};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use customer_svc_core::types::{Customer, CustomerChanges, Gender};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const CUSTOMER_COLUMNS: &str =
    "id, first_name, last_name, gender, timezone, birthday, user_id, created_at";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are part of the connect options so every pooled connection gets them.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to interact with the customers table.
    pub fn customers(&self) -> CustomerRepository {
        CustomerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for checked-out connections to be returned and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// Repository mapping [`Customer`] records onto the `customers` table.
#[derive(Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    /// Inserts a single customer row.
    pub async fn create(&self, customer: &Customer) -> Result<(), CustomerRepositoryError> {
        sqlx::query(
            "INSERT INTO customers \
             (id, first_name, last_name, gender, timezone, birthday, user_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(customer.id.to_string())
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(customer.gender.as_str())
        .bind(&customer.timezone)
        .bind(to_date_string(customer.birthday))
        .bind(customer.user_id.to_string())
        .bind(to_rfc3339(customer.created_at))
        .execute(&self.pool)
        .await
        .map_err(database_error("customers.create"))?;

        Ok(())
    }

    /// Loads a customer by its identity.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Customer, CustomerRepositoryError> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("customers.get_by_id"))?
        .ok_or(CustomerRepositoryError::NotFound)?;

        row.into_domain()
    }

    /// Loads the earliest customer created for the owning user.
    pub async fn get_by_user_id(&self, user_id: Uuid) -> Result<Customer, CustomerRepositoryError> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE user_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("customers.get_by_user_id"))?
        .ok_or(CustomerRepositoryError::NotFound)?;

        row.into_domain()
    }

    /// Loads every customer. The result set is unbounded.
    pub async fn get_all(&self) -> Result<Vec<Customer>, CustomerRepositoryError> {
        let rows = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("customers.get_all"))?;

        rows.into_iter().map(CustomerRow::into_domain).collect()
    }

    /// Loads one page of customers in creation order.
    pub async fn list_page(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Customer>, CustomerRepositoryError> {
        let rows = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error("customers.list_page"))?;

        rows.into_iter().map(CustomerRow::into_domain).collect()
    }

    /// Overwrites the mutable columns of an existing row.
    pub async fn update(
        &self,
        id: Uuid,
        customer: &Customer,
    ) -> Result<(), CustomerRepositoryError> {
        let result = sqlx::query(
            "UPDATE customers \
             SET first_name = ?, last_name = ?, gender = ?, timezone = ?, birthday = ? \
             WHERE id = ?",
        )
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(customer.gender.as_str())
        .bind(&customer.timezone)
        .bind(to_date_string(customer.birthday))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(database_error("customers.update"))?;

        if result.rows_affected() == 0 {
            return Err(CustomerRepositoryError::NotFound);
        }
        Ok(())
    }

    /// Writes only the supplied columns in one statement and returns the stored row.
    ///
    /// Columns absent from `changes` keep whatever value the row holds at
    /// execution time, so concurrent partial updates never revert each other.
    pub async fn apply_changes(
        &self,
        id: Uuid,
        changes: &CustomerChanges,
    ) -> Result<Customer, CustomerRepositoryError> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "UPDATE customers \
             SET first_name = COALESCE(?, first_name), \
                 last_name = COALESCE(?, last_name), \
                 gender = COALESCE(?, gender), \
                 timezone = COALESCE(?, timezone), \
                 birthday = COALESCE(?, birthday) \
             WHERE id = ? \
             RETURNING {CUSTOMER_COLUMNS}"
        ))
        .bind(changes.first_name.as_deref())
        .bind(changes.last_name.as_deref())
        .bind(changes.gender.map(Gender::as_str))
        .bind(changes.timezone.as_deref())
        .bind(changes.birthday.map(to_date_string))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error("customers.apply_changes"))?
        .ok_or(CustomerRepositoryError::NotFound)?;

        row.into_domain()
    }

    /// Removes a customer row.
    pub async fn delete(&self, id: Uuid) -> Result<(), CustomerRepositoryError> {
        let result = sqlx::query("DELETE FROM customers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(database_error("customers.delete"))?;

        if result.rows_affected() == 0 {
            return Err(CustomerRepositoryError::NotFound);
        }
        Ok(())
    }
}

/// Errors that can occur while reading or writing customers.
#[derive(Debug, Error)]
pub enum CustomerRepositoryError {
    #[error("customer not found")]
    NotFound,
    #[error("{context}: database error: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to decode stored customer: {0}")]
    Decode(String),
}

impl CustomerRepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

fn database_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> CustomerRepositoryError {
    move |source| CustomerRepositoryError::Database { context, source }
}

/// Raw `customers` row as stored in SQLite.
#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: String,
    first_name: String,
    last_name: String,
    gender: String,
    timezone: String,
    birthday: String,
    user_id: String,
    created_at: String,
}

impl CustomerRow {
    /// Converts the database row into the domain record.
    fn into_domain(self) -> Result<Customer, CustomerRepositoryError> {
        let id = parse_uuid("id", &self.id)?;
        let user_id = parse_uuid("user_id", &self.user_id)?;
        let gender = Gender::parse(&self.gender).ok_or_else(|| {
            CustomerRepositoryError::Decode(format!("unknown gender {:?}", self.gender))
        })?;
        let birthday = NaiveDate::parse_from_str(&self.birthday, "%Y-%m-%d").map_err(|err| {
            CustomerRepositoryError::Decode(format!("birthday {:?}: {err}", self.birthday))
        })?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|err| {
                CustomerRepositoryError::Decode(format!("created_at {:?}: {err}", self.created_at))
            })?
            .with_timezone(&Utc);

        Ok(Customer {
            id,
            first_name: self.first_name,
            last_name: self.last_name,
            gender,
            timezone: self.timezone,
            birthday,
            user_id,
            created_at,
        })
    }
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid, CustomerRepositoryError> {
    Uuid::parse_str(value)
        .map_err(|err| CustomerRepositoryError::Decode(format!("{column} {value:?}: {err}")))
}

fn to_date_string(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:", 5)
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn customer(first_name: &str, created_at: DateTime<Utc>) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            first_name: first_name.to_string(),
            last_name: "Hopper".to_string(),
            gender: Gender::Female,
            timezone: "America/New_York".to_string(),
            birthday: NaiveDate::from_ymd_opt(1906, 12, 9).expect("valid date"),
            user_id: Uuid::new_v4(),
            created_at,
        }
    }

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T12:00:00.250Z")
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'customers'",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 1, "expected customers table to be created");
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let db = setup_db().await;
        let repo = db.customers();
        let record = customer("Grace", base_time());

        repo.create(&record).await.expect("insert succeeds");
        let loaded = repo.get_by_id(record.id).await.expect("row exists");

        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn get_by_id_reports_not_found() {
        let db = setup_db().await;
        let err = db.customers().get_by_id(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_by_user_id_returns_earliest_match() {
        let db = setup_db().await;
        let repo = db.customers();
        let first = customer("Grace", base_time());
        let mut second = customer("Ada", base_time() + ChronoDuration::seconds(5));
        second.user_id = first.user_id;

        repo.create(&second).await.expect("insert second");
        repo.create(&first).await.expect("insert first");

        let loaded = repo.get_by_user_id(first.user_id).await.expect("row exists");
        assert_eq!(loaded.id, first.id);

        let err = repo.get_by_user_id(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn get_all_and_pages_follow_creation_order() {
        let db = setup_db().await;
        let repo = db.customers();
        let records: Vec<Customer> = (0..3)
            .map(|idx| customer(&format!("c{idx}"), base_time() + ChronoDuration::seconds(idx)))
            .collect();
        for record in records.iter().rev() {
            repo.create(record).await.expect("insert");
        }

        let all = repo.get_all().await.expect("list all");
        assert_eq!(all, records);

        let page = repo.list_page(1, 1).await.expect("page");
        assert_eq!(page, vec![records[1].clone()]);

        let tail = repo.list_page(10, 2).await.expect("tail page");
        assert_eq!(tail, vec![records[2].clone()]);

        let empty = repo.list_page(10, 3).await.expect("empty page");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn update_overwrites_mutable_columns() {
        let db = setup_db().await;
        let repo = db.customers();
        let record = customer("Grace", base_time());
        repo.create(&record).await.expect("insert");

        let mut changed = record.clone();
        changed.first_name = "Amazing Grace".to_string();
        changed.timezone = "UTC".to_string();
        changed.user_id = Uuid::new_v4();
        repo.update(record.id, &changed).await.expect("update");

        let loaded = repo.get_by_id(record.id).await.expect("row exists");
        assert_eq!(loaded.first_name, "Amazing Grace");
        assert_eq!(loaded.timezone, "UTC");
        assert_eq!(loaded.user_id, record.user_id, "owning user is immutable");
    }

    #[tokio::test]
    async fn update_reports_not_found_for_missing_row() {
        let db = setup_db().await;
        let record = customer("Grace", base_time());
        let err = db
            .customers()
            .update(record.id, &record)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn apply_changes_writes_only_supplied_columns() {
        let db = setup_db().await;
        let repo = db.customers();
        let record = customer("Grace", base_time());
        repo.create(&record).await.expect("insert");

        let changes = CustomerChanges {
            last_name: Some("Murray Hopper".to_string()),
            gender: Some(Gender::Female),
            ..CustomerChanges::default()
        };
        let updated = repo
            .apply_changes(record.id, &changes)
            .await
            .expect("apply changes");

        assert_eq!(updated.last_name, "Murray Hopper");
        assert_eq!(updated.first_name, record.first_name);
        assert_eq!(updated.timezone, record.timezone);
        assert_eq!(updated.birthday, record.birthday);
        assert_eq!(updated.created_at, record.created_at);
        assert_eq!(repo.get_by_id(record.id).await.expect("row"), updated);
    }

    #[tokio::test]
    async fn apply_changes_on_missing_row_creates_nothing() {
        let db = setup_db().await;
        let repo = db.customers();
        let changes = CustomerChanges {
            first_name: Some("Ghost".to_string()),
            ..CustomerChanges::default()
        };

        let err = repo
            .apply_changes(Uuid::new_v4(), &changes)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(repo.get_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn delete_removes_row_once() {
        let db = setup_db().await;
        let repo = db.customers();
        let record = customer("Grace", base_time());
        repo.create(&record).await.expect("insert");

        repo.delete(record.id).await.expect("delete");
        assert!(repo.get_by_id(record.id).await.unwrap_err().is_not_found());
        assert!(repo.delete(record.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_identity_surfaces_database_error() {
        let db = setup_db().await;
        let repo = db.customers();
        let record = customer("Grace", base_time());
        repo.create(&record).await.expect("insert");

        let err = repo.create(&record).await.unwrap_err();
        assert!(matches!(
            err,
            CustomerRepositoryError::Database {
                context: "customers.create",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn undecodable_rows_surface_decode_error() {
        let db = setup_db().await;
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO customers (id, first_name, last_name, gender, timezone, birthday, user_id, created_at) \
             VALUES (?, 'A', 'B', 'male', 'UTC', 'not-a-date', ?, '2024-01-01T00:00:00.000Z')",
        )
        .bind(id.to_string())
        .bind(Uuid::new_v4().to_string())
        .execute(db.pool())
        .await
        .expect("raw insert");

        let err = db.customers().get_by_id(id).await.unwrap_err();
        assert!(matches!(err, CustomerRepositoryError::Decode(_)));
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_pools() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("customers.db").display());
        let record = customer("Grace", base_time());

        {
            let db = Database::connect(&url, 2).await.expect("connect");
            db.run_migrations().await.expect("migrations");
            db.customers().create(&record).await.expect("insert");
            db.close().await;
        }

        let db = Database::connect(&url, 2).await.expect("reconnect");
        db.run_migrations().await.expect("migrations are idempotent");
        let loaded = db.customers().get_by_id(record.id).await.expect("row");
        assert_eq!(loaded, record);
    }
}
