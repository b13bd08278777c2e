//! Relational persistence for the LLM gateway: accounts, users, api keys,
//! subscriptions, usage logs, the billing ledger, and settings.
//!
//! Every operation is exposed as a trait with both a `sqlx::PgPool`-backed
//! implementation and an in-memory fake, so `gateway-scheduler`,
//! `gateway-proxy`, and `gateway-billing` can be unit tested without a live
//! database. `migrations/` holds the plain SQL schema; wiring it through
//! `sqlx::migrate!` is left to the deployment, per the gateway's
//! out-of-scope list.

pub mod accounts;
pub mod error;
pub mod settings;
pub mod usage;
pub mod users;

pub use accounts::{AccountRepository, InMemoryAccountRepository, PgAccountRepository};
pub use error::StoreError;
pub use settings::{PgSettingsRepository, SettingsRepository};
pub use usage::{InMemoryUsageStore, InsertOutcome, PgUsageStore, UsageStore};
pub use users::{
    ApiKeyRepository, InMemoryApiKeyRepository, InMemorySubscriptionRepository,
    InMemoryUserRepository, PgApiKeyRepository, PgSubscriptionRepository, PgUserRepository,
    SubscriptionRepository, UserRepository,
};
