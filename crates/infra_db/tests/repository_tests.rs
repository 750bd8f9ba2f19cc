//! Tests for the retried subscription repository
//!
//! The `local` and `unreachable` modules run without a database. The
//! `postgres` module needs a live server at `DATABASE_URL` and is ignored
//! by default:
//!
//! ```text
//! DATABASE_URL=postgres://localhost/subscriptions_test cargo test -- --ignored
//! ```

use std::time::Duration;

use core_kernel::{BackoffPolicy, CancellationToken, MonthDate, Retrier, RetryError, RetryPolicy};
use domain_billing::{NewSubscription, SummaryRequest};
use infra_db::{
    create_lazy_pool, DatabaseConfig, DatabaseError, ErrorKind, QueryOptions,
    SubscriptionRepository,
};
use uuid::Uuid;

fn month(year: i32, month: u32) -> MonthDate {
    MonthDate::new(year, month).unwrap()
}

fn fast_retrier(max_attempts: u32) -> Retrier<DatabaseError> {
    Retrier::new(
        RetryPolicy::new()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(1)))
            .with_predicate(DatabaseError::is_retryable),
    )
}

/// A repository whose pool points at a port nothing listens on
fn unreachable_repository(max_attempts: u32) -> SubscriptionRepository {
    let config = DatabaseConfig::new("postgres://postgres@127.0.0.1:1/none")
        .min_connections(0)
        .connect_timeout(Duration::from_millis(200));
    let pool = create_lazy_pool(&config).unwrap();
    SubscriptionRepository::new(pool, fast_retrier(max_attempts))
}

fn new_subscription(user_id: Uuid, service: &str, price: i32) -> NewSubscription {
    NewSubscription {
        service_name: service.to_string(),
        price,
        user_id,
        start_date: month(2025, 1),
        end_date: None,
    }
}

mod local {
    use super::*;

    #[tokio::test]
    async fn test_invalid_id_rejected_without_io() {
        let repo = unreachable_repository(3);
        let cancel = CancellationToken::new();

        for id in [0, -5] {
            let err = repo
                .get_by_id(&cancel, id, QueryOptions::pool())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                RetryError::NonRetryable(DatabaseError::InvalidId(_))
            ));
        }

        let err = repo.delete(&cancel, 0, QueryOptions::pool()).await.unwrap_err();
        assert!(matches!(
            err,
            RetryError::NonRetryable(DatabaseError::InvalidId(0))
        ));
        assert_eq!(repo.pool().size(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_name_rejected() {
        let repo = unreachable_repository(3);
        let cancel = CancellationToken::new();
        let new = new_subscription(Uuid::new_v4(), "", 10);

        let err = repo.create(&cancel, &new, QueryOptions::pool()).await.unwrap_err();
        assert!(matches!(
            err,
            RetryError::NonRetryable(DatabaseError::MissingValue("service_name"))
        ));
    }

    #[tokio::test]
    async fn test_invalid_subscription_rejected() {
        let repo = unreachable_repository(3);
        let cancel = CancellationToken::new();
        let mut new = new_subscription(Uuid::new_v4(), "Netflix", 10);
        new.end_date = Some(month(2024, 6));

        let err = repo.create(&cancel, &new, QueryOptions::pool()).await.unwrap_err();
        assert_eq!(err.inner().map(DatabaseError::kind), Some(ErrorKind::InvalidInput));

        let err = repo
            .update(&cancel, &new.with_id(3), QueryOptions::pool())
            .await
            .unwrap_err();
        assert!(err.is_non_retryable());
    }

    #[tokio::test]
    async fn test_inverted_summary_range_rejected() {
        let repo = unreachable_repository(3);
        let cancel = CancellationToken::new();
        let request = SummaryRequest::parse("06-2025", "01-2025").unwrap();

        let err = repo
            .summary(&cancel, &request, QueryOptions::pool())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetryError::NonRetryable(DatabaseError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let repo = unreachable_repository(3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = repo.list(&cancel, QueryOptions::pool()).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

mod unreachable {
    use super::*;

    #[tokio::test]
    async fn test_connection_failures_exhaust_attempts() {
        let repo = unreachable_repository(2);
        let cancel = CancellationToken::new();

        let err = repo
            .get_by_id(&cancel, 1, QueryOptions::pool())
            .await
            .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(source.is_retryable());
            }
            other => panic!("expected exhausted attempts, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let retrier = Retrier::new(
            RetryPolicy::new()
                .with_max_attempts(0)
                .with_backoff(BackoffPolicy::fixed(Duration::from_secs(60)))
                .with_predicate(DatabaseError::is_retryable),
        );
        let config = DatabaseConfig::new("postgres://postgres@127.0.0.1:1/none")
            .min_connections(0)
            .connect_timeout(Duration::from_millis(100));
        let repo = SubscriptionRepository::new(create_lazy_pool(&config).unwrap(), retrier);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            repo.list(&cancel, QueryOptions::pool()),
        )
        .await
        .expect("cancellation should interrupt the backoff wait")
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}

mod postgres {
    use super::*;
    use infra_db::{create_pool, run_migrations};

    async fn repository() -> SubscriptionRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(DatabaseConfig::new(url)).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SubscriptionRepository::new(pool, fast_retrier(3))
    }

    #[tokio::test]
    #[ignore]
    async fn test_crud_round_trip() {
        let repo = repository().await;
        let cancel = CancellationToken::new();
        let user = Uuid::new_v4();

        let created = repo
            .create(&cancel, &new_subscription(user, "Netflix", 15), QueryOptions::pool())
            .await
            .unwrap();
        assert!(created.id > 0);

        let fetched = repo
            .get_by_id(&cancel, created.id, QueryOptions::pool())
            .await
            .unwrap();
        assert_eq!(fetched, created);

        let mut changed = fetched.clone();
        changed.price = 20;
        changed.end_date = Some(month(2025, 12));
        let updated = repo.update(&cancel, &changed, QueryOptions::pool()).await.unwrap();
        assert_eq!(updated, changed);

        let all = repo.list(&cancel, QueryOptions::pool()).await.unwrap();
        assert!(all.iter().any(|s| s.id == created.id));

        repo.delete(&cancel, created.id, QueryOptions::pool()).await.unwrap();
        let err = repo
            .get_by_id(&cancel, created.id, QueryOptions::pool())
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::NonRetryable(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    #[ignore]
    async fn test_missing_rows_are_not_found() {
        let repo = repository().await;
        let cancel = CancellationToken::new();

        let err = repo.delete(&cancel, i64::MAX, QueryOptions::pool()).await.unwrap_err();
        assert!(matches!(err, RetryError::NonRetryable(ref e) if e.is_not_found()));

        let ghost = new_subscription(Uuid::new_v4(), "Ghost", 1).with_id(i64::MAX);
        let err = repo.update(&cancel, &ghost, QueryOptions::pool()).await.unwrap_err();
        assert!(matches!(err, RetryError::NonRetryable(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    #[ignore]
    async fn test_duplicate_is_not_retried() {
        let repo = repository().await;
        let cancel = CancellationToken::new();
        let new = new_subscription(Uuid::new_v4(), "Spotify", 10);

        repo.create(&cancel, &new, QueryOptions::pool()).await.unwrap();
        let err = repo.create(&cancel, &new, QueryOptions::pool()).await.unwrap_err();

        assert_eq!(err.inner().map(DatabaseError::kind), Some(ErrorKind::Duplicate));
        assert!(err.is_non_retryable());
    }

    #[tokio::test]
    #[ignore]
    async fn test_summary_filters_by_user_and_service() {
        let repo = repository().await;
        let cancel = CancellationToken::new();
        let user = Uuid::new_v4();

        let mut netflix = new_subscription(user, "Netflix", 20);
        netflix.end_date = Some(month(2025, 3));
        let mut spotify = new_subscription(user, "Spotify", 10);
        spotify.start_date = month(2025, 3);

        for new in [&netflix, &spotify] {
            repo.create(&cancel, new, QueryOptions::pool()).await.unwrap();
        }
        repo.create(
            &cancel,
            &new_subscription(Uuid::new_v4(), "Netflix", 500),
            QueryOptions::pool(),
        )
        .await
        .unwrap();

        let request = SummaryRequest::parse("02-2025", "03-2025").unwrap().for_user(user);
        let total = repo.summary(&cancel, &request, QueryOptions::pool()).await.unwrap();
        // Netflix: Feb 1 - Mar 31 is 59 days (2 buckets); Spotify: March is 31 days (2 buckets)
        assert_eq!(total, 20 * 2 + 10 * 2);

        let request = request.for_service("Spotify");
        let total = repo.summary(&cancel, &request, QueryOptions::pool()).await.unwrap();
        assert_eq!(total, 20);
    }

    #[tokio::test]
    #[ignore]
    async fn test_failure_inside_transaction_keeps_first_error() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(DatabaseConfig::new(url)).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = SubscriptionRepository::new(pool, fast_retrier(5));
        let cancel = CancellationToken::new();

        let tx = repo.begin().await.unwrap();
        // Rolled back with the transaction; makes the next insert fail with check_violation
        sqlx::query(
            "ALTER TABLE subscriptions ADD CONSTRAINT price_above_limit CHECK (price > 1000) NOT VALID",
        )
        .execute(&mut **tx.lock().await)
        .await
        .unwrap();

        let err = repo
            .create(
                &cancel,
                &new_subscription(Uuid::new_v4(), "Hulu", 15),
                QueryOptions::in_transaction(&tx),
            )
            .await
            .unwrap_err();

        match err {
            RetryError::NonRetryable(DatabaseError::Unknown { code, .. }) => {
                assert_eq!(code.as_deref(), Some("23514"));
            }
            other => panic!("expected the check violation, got {other}"),
        }

        tx.into_inner().rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_calls_share_caller_transaction() {
        let repo = repository().await;
        let cancel = CancellationToken::new();
        let user = Uuid::new_v4();

        let tx = repo.begin().await.unwrap();
        let created = repo
            .create(
                &cancel,
                &new_subscription(user, "Disney", 8),
                QueryOptions::in_transaction(&tx),
            )
            .await
            .unwrap();

        let seen = repo
            .get_by_id(&cancel, created.id, QueryOptions::in_transaction(&tx))
            .await
            .unwrap();
        assert_eq!(seen, created);

        tx.into_inner().rollback().await.unwrap();

        let err = repo
            .get_by_id(&cancel, created.id, QueryOptions::pool())
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::NonRetryable(ref e) if e.is_not_found()));
    }
}
