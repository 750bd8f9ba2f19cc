//! Subscription repository implementation
//!
//! Every public operation is one retried storage call. Input that can be
//! rejected without touching the database is rejected up front and
//! surfaces as [`RetryError::NonRetryable`].

use std::borrow::Cow;
use std::ops::{Deref, DerefMut};

use chrono::NaiveDate;
use core_kernel::{CancellationToken, MonthDate, Retrier, RetryError};
use domain_billing::{
    total_billed, validate, NewSubscription, Subscription, SubscriptionPeriod, SummaryRequest,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgConnection;
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, QueryBuilder, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::DatabaseError;

/// A transaction that can be shared across repository calls
pub type SharedTransaction = Mutex<Transaction<'static, Postgres>>;

/// Where a statement runs
#[derive(Clone, Copy, Default)]
pub enum Executor<'a> {
    /// A connection checked out from the repository pool
    #[default]
    Pool,
    /// The caller's open transaction
    Transaction(&'a SharedTransaction),
}

impl std::fmt::Debug for Executor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::Pool => f.write_str("Pool"),
            Executor::Transaction(_) => f.write_str("Transaction"),
        }
    }
}

impl<'a> Executor<'a> {
    fn is_transaction(self) -> bool {
        matches!(self, Executor::Transaction(_))
    }

    async fn connection(self, pool: &PgPool) -> Result<Connection<'a>, DatabaseError> {
        match self {
            Executor::Pool => Ok(Connection::Pooled(pool.acquire().await?)),
            Executor::Transaction(tx) => Ok(Connection::InTransaction(tx.lock().await)),
        }
    }
}

enum Connection<'a> {
    Pooled(PoolConnection<Postgres>),
    InTransaction(MutexGuard<'a, Transaction<'static, Postgres>>),
}

impl Deref for Connection<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Connection::Pooled(conn) => &**conn,
            Connection::InTransaction(tx) => &***tx,
        }
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Connection::Pooled(conn) => &mut **conn,
            Connection::InTransaction(tx) => &mut ***tx,
        }
    }
}

/// Per-call options
///
/// A statement that fails inside a caller's transaction is not retried:
/// Postgres aborts the transaction, so every later attempt would fail with
/// `25P02` and hide the first error.
///
/// # Example
///
/// ```rust,ignore
/// let tx = repo.begin().await?;
/// repo.create(&cancel, &new, QueryOptions::in_transaction(&tx)).await?;
/// repo.delete(&cancel, stale_id, QueryOptions::in_transaction(&tx)).await?;
/// tx.into_inner().commit().await?;
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions<'a> {
    pub executor: Executor<'a>,
}

impl<'a> QueryOptions<'a> {
    /// Runs the call on the repository pool
    pub fn pool() -> Self {
        Self::default()
    }

    /// Runs the call inside `tx`
    pub fn in_transaction(tx: &'a SharedTransaction) -> Self {
        Self {
            executor: Executor::Transaction(tx),
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: i64,
    service_name: String,
    price: i32,
    user_id: Uuid,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            service_name: row.service_name,
            price: row.price,
            user_id: row.user_id,
            start_date: MonthDate::from_date(row.start_date),
            end_date: row.end_date.map(MonthDate::from_date),
        }
    }
}

/// Repository for user subscriptions
///
/// Cheap to clone; clones share the pool and the retry policy.
#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: PgPool,
    retrier: Retrier<DatabaseError>,
}

impl SubscriptionRepository {
    /// Creates a new SubscriptionRepository
    ///
    /// # Arguments
    ///
    /// * `pool` - The PostgreSQL connection pool
    /// * `retrier` - Retry policy applied to every storage call
    pub fn new(pool: PgPool, retrier: Retrier<DatabaseError>) -> Self {
        Self { pool, retrier }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn retrier_for(&self, options: QueryOptions<'_>) -> Cow<'_, Retrier<DatabaseError>> {
        statement_retrier(&self.retrier, options.executor.is_transaction())
    }

    /// Opens a transaction for use with [`QueryOptions::in_transaction`]
    pub async fn begin(&self) -> Result<SharedTransaction, DatabaseError> {
        Ok(Mutex::new(self.pool.begin().await?))
    }

    /// Inserts a subscription and returns it with its assigned id
    #[instrument(skip(self, cancel, new), fields(user_id = %new.user_id, service = %new.service_name))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        new: &NewSubscription,
        options: QueryOptions<'_>,
    ) -> Result<Subscription, RetryError<DatabaseError>> {
        check_new(new).map_err(RetryError::NonRetryable)?;

        let pool = &self.pool;
        let created = self
            .retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                insert(&mut *conn, new).await
            })
            .await?;

        debug!(id = created.id, "Subscription created");
        Ok(created)
    }

    /// Fetches a subscription by id
    #[instrument(skip(self, cancel))]
    pub async fn get_by_id(
        &self,
        cancel: &CancellationToken,
        id: i64,
        options: QueryOptions<'_>,
    ) -> Result<Subscription, RetryError<DatabaseError>> {
        check_id(id).map_err(RetryError::NonRetryable)?;

        let pool = &self.pool;
        self.retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                fetch_by_id(&mut *conn, id).await
            })
            .await
    }

    /// Lists all subscriptions ordered by id
    #[instrument(skip(self, cancel))]
    pub async fn list(
        &self,
        cancel: &CancellationToken,
        options: QueryOptions<'_>,
    ) -> Result<Vec<Subscription>, RetryError<DatabaseError>> {
        let pool = &self.pool;
        let subscriptions = self
            .retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                fetch_all(&mut *conn).await
            })
            .await?;

        debug!(count = subscriptions.len(), "Subscriptions listed");
        Ok(subscriptions)
    }

    /// Replaces every field of an existing subscription
    #[instrument(skip(self, cancel, subscription), fields(id = subscription.id))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        subscription: &Subscription,
        options: QueryOptions<'_>,
    ) -> Result<Subscription, RetryError<DatabaseError>> {
        check_existing(subscription).map_err(RetryError::NonRetryable)?;

        let pool = &self.pool;
        self.retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                replace(&mut *conn, subscription).await
            })
            .await
    }

    /// Deletes a subscription by id
    #[instrument(skip(self, cancel))]
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        id: i64,
        options: QueryOptions<'_>,
    ) -> Result<(), RetryError<DatabaseError>> {
        check_id(id).map_err(RetryError::NonRetryable)?;

        let pool = &self.pool;
        self.retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                remove(&mut *conn, id).await
            })
            .await
    }

    /// Total billed cost of subscriptions active within the requested months
    ///
    /// Each matching subscription contributes `price * ceil(days / 30)` for
    /// the days it overlaps the range.
    #[instrument(skip(self, cancel, request), fields(from = %request.from, to = %request.to))]
    pub async fn summary(
        &self,
        cancel: &CancellationToken,
        request: &SummaryRequest,
        options: QueryOptions<'_>,
    ) -> Result<u64, RetryError<DatabaseError>> {
        validate(request)
            .map_err(DatabaseError::from)
            .map_err(RetryError::NonRetryable)?;

        let pool = &self.pool;
        let periods = self
            .retrier_for(options)
            .run(cancel, move || async move {
                let mut conn = options.executor.connection(pool).await?;
                fetch_overlapping(&mut *conn, request).await
            })
            .await?;

        let total = total_billed(&request.date_range(), &periods);
        debug!(subscriptions = periods.len(), total, "Summary computed");
        Ok(total)
    }
}

/// The retrier for one statement; inside a transaction the first failure is final
fn statement_retrier(
    retrier: &Retrier<DatabaseError>,
    in_transaction: bool,
) -> Cow<'_, Retrier<DatabaseError>> {
    if !in_transaction {
        return Cow::Borrowed(retrier);
    }
    let policy = retrier.policy().clone().with_predicate(|_: &DatabaseError| false);
    Cow::Owned(Retrier::new(policy))
}

fn check_id(id: i64) -> Result<(), DatabaseError> {
    if id <= 0 {
        return Err(DatabaseError::InvalidId(id));
    }
    Ok(())
}

fn check_new(new: &NewSubscription) -> Result<(), DatabaseError> {
    if new.service_name.trim().is_empty() {
        return Err(DatabaseError::MissingValue("service_name"));
    }
    validate(new)?;
    Ok(())
}

fn check_existing(subscription: &Subscription) -> Result<(), DatabaseError> {
    check_id(subscription.id)?;
    if subscription.service_name.trim().is_empty() {
        return Err(DatabaseError::MissingValue("service_name"));
    }
    validate(subscription)?;
    Ok(())
}

async fn insert<'e, E>(executor: E, new: &NewSubscription) -> Result<Subscription, DatabaseError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        INSERT INTO subscriptions (service_name, price, user_id, start_date, end_date)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, service_name, price, user_id, start_date, end_date
        "#,
    )
    .bind(&new.service_name)
    .bind(new.price)
    .bind(new.user_id)
    .bind(new.start_date.first_day())
    .bind(new.end_date.map(|d| d.first_day()))
    .fetch_one(executor)
    .await?;

    Ok(row.into())
}

async fn fetch_by_id<'e, E>(executor: E, id: i64) -> Result<Subscription, DatabaseError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT id, service_name, price, user_id, start_date, end_date
        FROM subscriptions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| DatabaseError::not_found("Subscription", id))?;

    Ok(row.into())
}

async fn fetch_all<'e, E>(executor: E) -> Result<Vec<Subscription>, DatabaseError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT id, service_name, price, user_id, start_date, end_date
        FROM subscriptions
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Subscription::from).collect())
}

async fn replace<'e, E>(executor: E, sub: &Subscription) -> Result<Subscription, DatabaseError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        UPDATE subscriptions
        SET service_name = $2, price = $3, user_id = $4, start_date = $5, end_date = $6
        WHERE id = $1
        RETURNING id, service_name, price, user_id, start_date, end_date
        "#,
    )
    .bind(sub.id)
    .bind(&sub.service_name)
    .bind(sub.price)
    .bind(sub.user_id)
    .bind(sub.start_date.first_day())
    .bind(sub.end_date.map(|d| d.first_day()))
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| DatabaseError::not_found("Subscription", sub.id))?;

    Ok(row.into())
}

async fn remove<'e, E>(executor: E, id: i64) -> Result<(), DatabaseError>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::not_found("Subscription", id));
    }
    Ok(())
}

/// Builds the query selecting every subscription whose period touches the request range
fn overlapping_query(request: &SummaryRequest) -> QueryBuilder<'_, Postgres> {
    let range = request.date_range();

    let mut query = QueryBuilder::new(
        "SELECT id, service_name, price, user_id, start_date, end_date FROM subscriptions WHERE start_date <= ",
    );
    query.push_bind(range.to);
    query.push(" AND (end_date IS NULL OR end_date >= ");
    query.push_bind(request.from.first_day());
    query.push(")");

    if let Some(user_id) = request.user_id {
        query.push(" AND user_id = ");
        query.push_bind(user_id);
    }
    if let Some(service_name) = &request.service_name {
        query.push(" AND service_name = ");
        query.push_bind(service_name);
    }
    query.push(" ORDER BY id");
    query
}

async fn fetch_overlapping<'e, E>(
    executor: E,
    request: &SummaryRequest,
) -> Result<Vec<SubscriptionPeriod>, DatabaseError>
where
    E: PgExecutor<'e>,
{
    let rows = overlapping_query(request)
        .build_query_as::<SubscriptionRow>()
        .fetch_all(executor)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| SubscriptionPeriod::from(&Subscription::from(row)))
        .collect())
}
