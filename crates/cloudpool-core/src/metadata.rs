//! Cloud pool metadata.
//!
//! Tells clients which backend a pool runs on and which versions of the
//! pool API it speaks. Version strings are dot-separated numbers such as
//! `4` or `4.0`.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Identity and API versions of a cloud pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawMetadata")]
pub struct CloudPoolMetadata {
    pool_identifier: String,
    supported_api_versions: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    pool_identifier: String,
    supported_api_versions: Vec<String>,
}

impl TryFrom<RawMetadata> for CloudPoolMetadata {
    type Error = CoreError;

    fn try_from(raw: RawMetadata) -> Result<Self> {
        Self::new(raw.pool_identifier, raw.supported_api_versions)
    }
}

impl CloudPoolMetadata {
    /// Create metadata for the backend named `pool_identifier`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidMetadata` if the identifier is blank, no
    /// version is given, or a version is not a dot-separated number.
    pub fn new<I, V>(pool_identifier: impl Into<String>, supported_api_versions: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let pool_identifier = pool_identifier.into();
        if pool_identifier.trim().is_empty() {
            return Err(CoreError::InvalidMetadata(
                "pool identifier must not be blank".to_string(),
            ));
        }

        let supported_api_versions: Vec<String> =
            supported_api_versions.into_iter().map(Into::into).collect();
        if supported_api_versions.is_empty() {
            return Err(CoreError::InvalidMetadata(
                "at least one supported API version is required".to_string(),
            ));
        }
        if let Some(bad) = supported_api_versions.iter().find(|v| !is_version(v)) {
            return Err(CoreError::InvalidMetadata(format!(
                "malformed API version: {bad:?}"
            )));
        }

        Ok(Self {
            pool_identifier,
            supported_api_versions,
        })
    }

    /// The backend the pool runs on.
    #[must_use]
    pub fn pool_identifier(&self) -> &str {
        &self.pool_identifier
    }

    /// API versions the pool implements.
    #[must_use]
    pub fn supported_api_versions(&self) -> &[String] {
        &self.supported_api_versions
    }
}

fn is_version(s: &str) -> bool {
    s.split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}
