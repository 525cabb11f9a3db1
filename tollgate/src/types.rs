//! Common type definitions.
//!
//! Account identifiers are opaque strings assigned by the external account
//! provisioning system; the ledger never parses or generates them. Pool
//! ordinals index the credential pool in display order.

/// External account identifier (opaque, assigned at provisioning).
pub type AccountId = String;

/// Model identifier as configured in the pricing tables, e.g. `"swift-large"`.
pub type ModelKey = String;

/// Zero-based ordinal of a credential in the pool, in pool order.
pub type PoolOrdinal = usize;

/// Reserved rate-limit scope shared by all accounts.
pub const GLOBAL_SCOPE: &str = "global";
