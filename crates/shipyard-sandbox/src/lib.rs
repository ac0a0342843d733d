pub mod credentials;
pub mod http;
pub mod mock;

pub use credentials::{ProxyClaims, ProxyCredentialMinter, ProxyEnv};
pub use http::{HttpClientFactory, HttpSandboxClient, HttpSandboxConfig};
pub use mock::{MockCall, MockFactory, MockReply, MockSandbox};
