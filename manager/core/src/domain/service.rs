// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service identity types
//!
//! A deployed service is identified by its [`ServiceKey`], the pair of a
//! validated [`ServiceName`] and a semantic [`ServiceVersion`]. Every artifact
//! the manager produces for an instance (container name, image reference,
//! proxy route id) is derived from the key, so the key is the only identity
//! shared between the record store, the runtime and the proxy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::credentials::CredentialId;

pub const DEFAULT_CONTAINER_PREFIX: &str = "skiff";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid service name '{0}': only lowercase letters, digits and underscores are allowed, and it may not start or end with an underscore")]
    InvalidName(String),

    #[error("Invalid service version '{value}': {reason}")]
    InvalidVersion { value: String, reason: String },
}

/// Name of a service family. Lowercase ASCII alphanumerics and `_`, never
/// starting or ending with `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    pub fn parse(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        let allowed = value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if value.is_empty() || !allowed || value.starts_with('_') || value.ends_with('_') {
            return Err(ValidationError::InvalidName(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl FromStr for ServiceName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic version of one deployed build. Ordered by semver precedence.
///
/// Build metadata (`+...`) is rejected because `+` is not a legal character in
/// container names or image tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceVersion(semver::Version);

impl ServiceVersion {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let version = semver::Version::parse(value).map_err(|e| ValidationError::InvalidVersion {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        if !version.build.is_empty() {
            return Err(ValidationError::InvalidVersion {
                value: value.to_string(),
                reason: "build metadata is not supported".to_string(),
            });
        }
        Ok(Self(version))
    }

    pub fn semver(&self) -> &semver::Version {
        &self.0
    }
}

impl TryFrom<String> for ServiceVersion {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceVersion> for String {
    fn from(version: ServiceVersion) -> Self {
        version.0.to_string()
    }
}

impl FromStr for ServiceVersion {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `(name, version)` pair identifying one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: ServiceName,
    pub version: ServiceVersion,
}

impl ServiceKey {
    pub fn new(name: ServiceName, version: ServiceVersion) -> Self {
        Self { name, version }
    }

    pub fn parse(name: &str, version: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            name: ServiceName::parse(name)?,
            version: ServiceVersion::parse(version)?,
        })
    }

    /// Image reference built for this instance, `{name}:{version}`.
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Derives container names from keys and back.
///
/// Names are `{prefix}-{name}-{version}`. Service names never contain `-`,
/// so the first `-` after the prefix always separates name from version even
/// when the version carries a pre-release tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNaming {
    prefix: String,
}

impl ContainerNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn container_name(&self, key: &ServiceKey) -> String {
        format!("{}-{}-{}", self.prefix, key.name, key.version)
    }

    /// Returns `None` for names that were not produced by [`Self::container_name`].
    pub fn parse(&self, container_name: &str) -> Option<ServiceKey> {
        let rest = container_name
            .trim_start_matches('/')
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?;
        let (name, version) = rest.split_once('-')?;
        ServiceKey::parse(name, version).ok()
    }
}

impl Default for ContainerNaming {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER_PREFIX)
    }
}

/// Persisted record of one deployed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: ServiceName,
    pub version: ServiceVersion,
    pub image: String,
    pub url: String,
    pub main: bool,
    pub credential_id: CredentialId,
    pub deployed_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.name.clone(), self.version.clone())
    }
}

/// All deployed versions sharing a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFamily {
    pub name: ServiceName,
    pub main: Option<ServiceVersion>,
    /// Ascending by semver precedence.
    pub shadows: Vec<ServiceVersion>,
}

impl ServiceFamily {
    pub fn from_instances<'a>(
        name: ServiceName,
        instances: impl IntoIterator<Item = &'a ServiceInstance>,
    ) -> Self {
        let mut main = None;
        let mut shadows = Vec::new();
        for instance in instances.into_iter().filter(|i| i.name == name) {
            if instance.main {
                main = Some(instance.version.clone());
            } else {
                shadows.push(instance.version.clone());
            }
        }
        shadows.sort();
        Self { name, main, shadows }
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.shadows.is_empty()
    }
}
