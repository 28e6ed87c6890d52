// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Image builder backed by the s2i and docker command line tools.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::build::{BuildError, ImageBuilder};

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LOADED_IMAGE_PREFIX: &str = "Loaded image: ";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks an uploaded source tarball, plain or gzipped, into `dest`.
/// Blocking; run it on a blocking thread.
pub fn unpack_source_archive(archive: &[u8], dest: &Path) -> Result<(), BuildError> {
    let reader: Box<dyn std::io::Read + '_> = if archive.starts_with(&GZIP_MAGIC) {
        Box::new(flate2::read::GzDecoder::new(archive))
    } else {
        Box::new(archive)
    };

    let mut tar = tar::Archive::new(reader);
    tar.unpack(dest).map_err(|e| {
        BuildError::InvalidArchive(format!("only tar archives are accepted: {}", e))
    })?;
    Ok(())
}

/// Keeps only the lines s2i marks as errors.
pub fn filter_error_lines(output: &str) -> String {
    output
        .lines()
        .filter(|line| line.starts_with("ERROR"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extracts the tags reported by `docker load`.
pub fn parse_loaded_tags(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(LOADED_IMAGE_PREFIX))
        .map(|tag| tag.trim().to_string())
        .collect()
}

pub struct S2iImageBuilder {
    builder_image: String,
    s2i_binary: String,
    docker_binary: String,
    timeout: Duration,
}

impl S2iImageBuilder {
    pub fn new(builder_image: impl Into<String>) -> Self {
        Self {
            builder_image: builder_image.into(),
            s2i_binary: "s2i".to_string(),
            docker_binary: "docker".to_string(),
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_binaries(mut self, s2i: impl Into<String>, docker: impl Into<String>) -> Self {
        self.s2i_binary = s2i.into();
        self.docker_binary = docker.into();
        self
    }

    /// `s2i build <source> <builder image> <tag>`, stderr folded into stdout
    async fn s2i_build(&self, source: &str, image: &str) -> Result<(), BuildError> {
        info!("Running s2i for image {} from {}", image, source);

        let mut cmd = Command::new(&self.s2i_binary);
        cmd.arg("build")
            .arg(source)
            .arg(&self.builder_image)
            .arg(image)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::Unavailable(format!(
                    "{} not found on PATH",
                    self.s2i_binary
                )))
            }
            Ok(Err(e)) => return Err(BuildError::Io(e)),
            Err(_) => {
                return Err(BuildError::Failed(format!(
                    "build of {} timed out after {}s",
                    image,
                    self.timeout.as_secs()
                )))
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            debug!("{}", combined);
            Ok(())
        } else {
            warn!("s2i failed for image {}", image);
            Err(BuildError::Failed(filter_error_lines(&combined)))
        }
    }
}

#[async_trait]
impl ImageBuilder for S2iImageBuilder {
    async fn build_from_source(&self, path: &Path, image: &str) -> Result<(), BuildError> {
        self.s2i_build(&path.to_string_lossy(), image).await
    }

    async fn build_from_git(&self, url: &str, image: &str) -> Result<(), BuildError> {
        self.s2i_build(url, image).await
    }

    async fn load_image(&self, archive: Bytes) -> Result<Vec<String>, BuildError> {
        let mut child = Command::new(&self.docker_binary)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BuildError::Unavailable(format!("{} not found on PATH", self.docker_binary))
                }
                _ => BuildError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&archive).await?;
            // Closing stdin lets docker finish reading
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BuildError::Failed(format!(
                "Failed to load image archive: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let tags = parse_loaded_tags(&String::from_utf8_lossy(&output.stdout));
        info!("Loaded image archive with tags {:?}", tags);
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_error_lines() {
        let output = "I0101 building\nERROR: unable to fetch source\nwarning: slow\nERROR: exit 1\n";
        assert_eq!(
            filter_error_lines(output),
            "ERROR: unable to fetch source\nERROR: exit 1"
        );
        assert_eq!(filter_error_lines("all good\n"), "");
    }

    #[test]
    fn test_parse_loaded_tags() {
        let output = "Loaded image: svc:1.0.0\nLoaded image ID: sha256:abc\nLoaded image: other:2.0.0\n";
        assert_eq!(parse_loaded_tags(output), vec!["svc:1.0.0", "other:2.0.0"]);
    }

    #[test]
    fn test_unpack_plain_and_gzipped_archives() {
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"print('hello')\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "app/service.py", &content[..])
            .unwrap();
        let plain = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        unpack_source_archive(&plain, dir.path()).unwrap();
        assert!(dir.path().join("app/service.py").exists());

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &plain).unwrap();
        let gzipped = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        unpack_source_archive(&gzipped, dir.path()).unwrap();
        assert!(dir.path().join("app/service.py").exists());
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = vec![0x42u8; 2048];
        assert!(matches!(
            unpack_source_archive(&garbage, dir.path()),
            Err(BuildError::InvalidArchive(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let builder = S2iImageBuilder::new("builder:latest")
            .with_binaries("skiff-test-no-such-s2i", "skiff-test-no-such-docker");
        let result = builder.build_from_git("https://example.invalid/repo.git", "svc:1.0.0").await;
        assert!(matches!(result, Err(BuildError::Unavailable(_))));

        let result = builder.load_image(Bytes::from_static(b"not a tar")).await;
        assert!(matches!(result, Err(BuildError::Unavailable(_))));
    }
}
