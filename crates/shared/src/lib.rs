//! Shared infrastructure for the Certiva platform.
//!
//! Home of the database pool constructors, embedded migrations, and the
//! domain types that more than one crate needs (organization roles and
//! subscription tiers). Anything provider-specific or billing-specific
//! lives in its own crate; this one stays small on purpose.

pub mod db;
pub mod types;

// Database
pub use db::{create_migration_pool, create_pool, run_migrations};

// Domain types
pub use types::{OrgRole, SubscriptionTier};
