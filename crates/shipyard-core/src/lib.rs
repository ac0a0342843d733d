pub mod deployment;
pub mod errors;
pub mod events;
pub mod files;
pub mod ids;
pub mod policy;
pub mod sandbox;

pub use deployment::{DeploymentOutcome, DeploymentRequest, InstanceRef, Session};
pub use errors::SandboxError;
pub use events::DeploymentEvent;
pub use files::{FileRecord, FileSet, FileSource, ProjectFiles};
pub use ids::{DeploymentId, InstanceId, SessionId};
pub use policy::{PathPrefixPolicy, ReadOnlyPolicy};
pub use sandbox::{EnvProvider, SandboxClient, SandboxClientFactory};
