pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use fixtures::{DemoSeedDataset, SeedResult, ThreadSeedInfo, VerificationResult};
pub use repositories::{RepositoryError, RepositorySet};
