//! Usage & Billing Pipeline: turns a completed proxy request into a cost
//! breakdown, a billing route decision (subscription vs balance), and an
//! idempotent ledger write. Also owns the remote price table refresh.

pub mod pipeline;
pub mod pricing;

pub use pipeline::{BillingConfig, BillingError, BillingPipeline, BillingRoute, CostBreakdown, InsufficientFunds, compute_cost};
pub use pricing::{PriceTable, PricingRefreshError};
