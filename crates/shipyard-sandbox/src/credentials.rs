//! Short-lived credentials for templates that call an AI proxy.
//!
//! A fresh instance that needs the proxy receives `AI_PROXY_URL` and an
//! HS256 token bound to the deploying session in `AI_PROXY_TOKEN`.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use shipyard_core::errors::SandboxError;
use shipyard_core::ids::SessionId;
use shipyard_core::sandbox::EnvProvider;

pub const PROXY_URL_VAR: &str = "AI_PROXY_URL";
pub const PROXY_TOKEN_VAR: &str = "AI_PROXY_TOKEN";
const PROXY_SCOPE: &str = "ai-proxy";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyClaims {
    /// Session the instance was provisioned for.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub scope: String,
}

pub struct ProxyCredentialMinter {
    secret: SecretString,
    ttl: Duration,
}

impl ProxyCredentialMinter {
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn mint(&self, session_id: &SessionId) -> Result<String, SandboxError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = ProxyClaims {
            sub: session_id.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
            jti: random_jti(),
            scope: PROXY_SCOPE.to_string(),
        };

        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| SandboxError::Credential(format!("failed to sign proxy token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<ProxyClaims, SandboxError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let data = decode::<ProxyClaims>(token, &key, &validation)
            .map_err(|e| SandboxError::Credential(format!("invalid proxy token: {e}")))?;
        if data.claims.scope != PROXY_SCOPE {
            return Err(SandboxError::Credential(format!(
                "unexpected token scope: {}",
                data.claims.scope
            )));
        }
        Ok(data.claims)
    }
}

fn random_jti() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Template environment for new instances.
///
/// Static variables are always passed through; proxy variables are added
/// only when a proxy is configured.
pub struct ProxyEnv {
    static_vars: HashMap<String, String>,
    proxy: Option<(String, ProxyCredentialMinter)>,
}

impl ProxyEnv {
    pub fn new(static_vars: HashMap<String, String>) -> Self {
        Self {
            static_vars,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, url: impl Into<String>, minter: ProxyCredentialMinter) -> Self {
        self.proxy = Some((url.into(), minter));
        self
    }

    pub fn requires_proxy(&self) -> bool {
        self.proxy.is_some()
    }
}

impl EnvProvider for ProxyEnv {
    fn env_vars(&self, session_id: &SessionId) -> Result<HashMap<String, String>, SandboxError> {
        let mut vars = self.static_vars.clone();
        if let Some((url, minter)) = &self.proxy {
            let token = minter.mint(session_id)?;
            vars.insert(PROXY_URL_VAR.to_string(), url.clone());
            vars.insert(PROXY_TOKEN_VAR.to_string(), token);
            debug!(session_id = %session_id, "minted proxy credential");
        }
        Ok(vars)
    }
}
