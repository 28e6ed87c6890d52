// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// The build tool ran and reported failure. Carries the tool's error lines.
    #[error("Image build failed: {0}")]
    Failed(String),
    #[error("Invalid source archive: {0}")]
    InvalidArchive(String),
    #[error("Build tool unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error during build: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces container images from service bundles.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build `image` from a source directory on the manager host.
    async fn build_from_source(&self, path: &Path, image: &str) -> Result<(), BuildError>;

    /// Build `image` from a git repository URL.
    async fn build_from_git(&self, url: &str, image: &str) -> Result<(), BuildError>;

    /// Load an uploaded image archive into the runtime's image store.
    /// Returns the tags contained in the archive.
    async fn load_image(&self, archive: Bytes) -> Result<Vec<String>, BuildError>;
}
