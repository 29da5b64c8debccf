//! Proxy credential and usage-governance engine for an upstream LLM API.
//!
//! Issues scoped proxy keys, forwards validated chat-completion requests
//! with the organization's encrypted upstream secret, meters every
//! successful call into an append-only ledger, and raises advisory budget
//! alerts. Governance observes; it never blocks traffic.

pub mod cipher;
pub mod config;
pub mod credentials;
mod error;
pub mod forwarder;
pub mod governor;
pub mod http;
pub mod ledger;
pub mod limits;
pub mod pricing;
pub mod store;
pub mod store_types;

pub use cipher::{CipherError, SecretCipher};
pub use config::{AppConfig, ConfigError, FileConfig, LoadOptions};
pub use credentials::{CredentialError, CredentialVault, SECRET_PREFIX};
pub use error::ProxyError;
pub use forwarder::{ProxyForwarder, TRACE_HEADER};
pub use governor::{BudgetGovernor, DEFAULT_THRESHOLD_LADDER, GovernorError};
pub use http::{AppState, StartupError, router};
pub use ledger::{LedgerError, UsageEvent, UsageLedger};
pub use limits::{RateLimitConfig, RateLimiter};
pub use pricing::{PriceSnapshot, PricingError, PricingTable, cost_usd_micros};
pub use store::{SqliteStore, StoreError, now_millis, period_key_utc};
pub use store_types::{
    AlertRecord, BudgetConfigRecord, BudgetScope, ProxyCredentialRecord, UsageRecord,
};
