//! Repository implementations for domain entities
//!
//! Repositories encapsulate SQL and map between database rows and domain
//! types. Queries are checked at runtime so the crate builds without a
//! live database.

pub mod subscription;

pub use subscription::{Executor, QueryOptions, SharedTransaction, SubscriptionRepository};
