use std::fmt;

use crate::{
    config::{DEFAULT_REGION, StorageConfig},
    error::StorageError,
};

pub const ACCESS_KEY_VAR: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_VAR: &str = "AWS_SESSION_TOKEN";
pub const REGION_VAR: &str = "AWS_REGION";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Read the standard AWS variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StorageError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let access_key_id = non_empty(ACCESS_KEY_VAR).ok_or_else(|| {
            StorageError::CredentialResolutionFailed(format!(
                "no access key in [storage] config and {ACCESS_KEY_VAR} is not set"
            ))
        })?;
        let secret_access_key = non_empty(SECRET_KEY_VAR).ok_or_else(|| {
            StorageError::CredentialResolutionFailed(format!(
                "no secret key in [storage] config and {SECRET_KEY_VAR} is not set"
            ))
        })?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: non_empty(SESSION_TOKEN_VAR),
        })
    }
}

/// Where credentials come from. Resolved when storage access is first established.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Static(Credentials),
    Environment,
}

impl CredentialSource {
    /// Static keys from the config if both are present, otherwise the environment.
    pub fn from_config(config: &StorageConfig) -> Self {
        match (&config.access_key_id, &config.secret_access_key) {
            (Some(id), Some(secret)) => CredentialSource::Static(Credentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
                session_token: config.session_token.clone(),
            }),
            _ => CredentialSource::Environment,
        }
    }

    pub fn resolve(&self) -> Result<Credentials, StorageError> {
        match self {
            CredentialSource::Static(creds) => Ok(creds.clone()),
            CredentialSource::Environment => Credentials::from_lookup(|k| std::env::var(k).ok()),
        }
    }
}

/// Region from the config, then `AWS_REGION`, then the default.
pub fn resolve_region(config: &StorageConfig, lookup: impl Fn(&str) -> Option<String>) -> String {
    config
        .region
        .clone()
        .or_else(|| lookup(REGION_VAR))
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}
