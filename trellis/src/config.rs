use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

/// Login material for one service. Which fields matter depends on the
/// service; `Direct` only ever reads `token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

/// Credentials file: a json object keyed by lowercase service tag.
///
/// ```json
/// { "direct": { "token": "..." } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialStore(HashMap<String, Credentials>);

impl CredentialStore {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let bytes = std::fs::read(path)
            .with_context(|| format!("could not read credentials file {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("could not parse credentials file {}", path.display()))
    }

    pub fn get(&self, service: &str) -> Credentials {
        self.0.get(&service.to_lowercase()).cloned().unwrap_or_default()
    }
}
