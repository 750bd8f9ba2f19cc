//! Infrastructure Database Layer
//!
//! PostgreSQL persistence for subscriptions on top of SQLx. Every storage
//! call runs under a [`core_kernel::Retrier`]; raw driver errors are
//! classified into [`ErrorKind`]s that decide whether a retry is worthwhile.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, QueryOptions, Settings, SubscriptionRepository};
//!
//! let settings = Settings::load()?;
//! let pool = create_pool(settings.database.pool_config()).await?;
//! let repo = SubscriptionRepository::new(pool, settings.retry.retrier());
//! let total = repo.summary(&cancel, &request, QueryOptions::pool()).await?;
//! ```

pub mod pool;
pub mod error;
pub mod repositories;
pub mod settings;
pub mod telemetry;

pub use pool::{DatabasePool, create_pool, create_lazy_pool, run_migrations, DatabaseConfig};
pub use error::{classify, classify_database_code, DatabaseError, ErrorKind};
pub use repositories::{Executor, QueryOptions, SharedTransaction, SubscriptionRepository};
pub use settings::{DatabaseSettings, RetrySettings, Settings};
pub use telemetry::init_tracing;
