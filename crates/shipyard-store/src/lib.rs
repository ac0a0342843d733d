pub mod database;
pub mod deployments;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod state;

pub use database::Database;
pub use deployments::{AttemptRow, DeploymentHistoryRepo, DeploymentRow, DeploymentStatus};
pub use error::StoreError;
pub use state::{DeploymentStateRepo, StoredState};
