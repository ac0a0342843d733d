/// Template policy deciding which paths belong to the externally deployed
/// backend and must never be written by the orchestrator.
pub trait ReadOnlyPolicy: Send + Sync {
    fn is_read_only(&self, path: &str) -> bool;
}

/// Read-only areas expressed as directory prefixes (e.g. `api-worker/`).
#[derive(Clone, Debug)]
pub struct PathPrefixPolicy {
    prefixes: Vec<String>,
}

impl PathPrefixPolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes = prefixes
            .into_iter()
            .map(|p| {
                let p = normalize(&p.into()).to_string();
                if p.ends_with('/') {
                    p
                } else {
                    format!("{p}/")
                }
            })
            .filter(|p| p != "/")
            .collect();
        Self { prefixes }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

impl Default for PathPrefixPolicy {
    fn default() -> Self {
        Self::new(["api-worker/"])
    }
}

impl ReadOnlyPolicy for PathPrefixPolicy {
    fn is_read_only(&self, path: &str) -> bool {
        let path = normalize(path);
        self.prefixes.iter().any(|prefix| {
            path.starts_with(prefix.as_str()) || path == prefix.trim_end_matches('/')
        })
    }
}

/// Strip `./` and leading `/` so `./api-worker/x` and `/api-worker/x` match.
fn normalize(path: &str) -> &str {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            return p;
        }
    }
}
