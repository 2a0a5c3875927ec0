//! Artifact resolution.
//!
//! Archives follow `<name>-<arch>-linux.zip` (glibc) or
//! `<name>-<arch>-linux-musl.zip` (musl). The resolver scans a directory
//! for the single archive matching a cell's architecture and libc.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use matrix_shared_types::{Architecture, LibcVariant};

/// Errors raised while resolving an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no archive for {arch}/{libc} in {dir}")]
    Missing {
        dir: PathBuf,
        arch: Architecture,
        libc: LibcVariant,
    },

    #[error("{count} archives match {arch}/{libc} in {dir}: {names}")]
    Ambiguous {
        dir: PathBuf,
        arch: Architecture,
        libc: LibcVariant,
        count: usize,
        names: String,
    },

    #[error("cannot read artifact directory {dir}: {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Components parsed from an archive file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub name: String,
    pub arch: Architecture,
    pub libc: LibcVariant,
}

/// Parse `<name>-<arch>-linux[-musl].zip`.
pub fn parse_archive_name(file_name: &str) -> Option<ArchiveName> {
    let stem = file_name.strip_suffix(".zip")?;
    let (rest, libc) = if let Some(rest) = stem.strip_suffix(LibcVariant::Musl.archive_suffix()) {
        (rest, LibcVariant::Musl)
    } else {
        (stem.strip_suffix(LibcVariant::Glibc.archive_suffix())?, LibcVariant::Glibc)
    };
    let (name, arch) = rest.rsplit_once('-')?;
    if name.is_empty() {
        return None;
    }
    Some(ArchiveName {
        name: name.to_string(),
        arch: arch.parse().ok()?,
        libc,
    })
}

/// The archive selected for a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub file_name: String,
}

/// Scans an artifact directory for archives.
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    dir: PathBuf,
    /// Restrict matches to archives whose `<name>` equals this.
    name: Option<String>,
}

impl ArtifactResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Find exactly one archive for `arch`/`libc`.
    pub async fn resolve(
        &self,
        arch: Architecture,
        libc: LibcVariant,
    ) -> Result<ResolvedArtifact, ArtifactError> {
        let io_err = |source| ArtifactError::Io {
            dir: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut matches = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(parsed) = parse_archive_name(&file_name) else {
                continue;
            };
            if parsed.arch != arch || parsed.libc != libc {
                continue;
            }
            if let Some(name) = &self.name {
                if parsed.name != *name {
                    continue;
                }
            }
            matches.push(ResolvedArtifact {
                path: entry.path(),
                file_name,
            });
        }

        matches.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        match matches.len() {
            0 => Err(ArtifactError::Missing {
                dir: self.dir.clone(),
                arch,
                libc,
            }),
            1 => {
                let artifact = matches.remove(0);
                debug!("Resolved {}/{} to {}", arch, libc, artifact.file_name);
                Ok(artifact)
            }
            count => Err(ArtifactError::Ambiguous {
                dir: self.dir.clone(),
                arch,
                libc,
                count,
                names: matches
                    .iter()
                    .map(|m| m.file_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_glibc_archive() {
        let parsed = parse_archive_name("amazon-q-developer-cli-x86_64-linux.zip").unwrap();
        assert_eq!(parsed.name, "amazon-q-developer-cli");
        assert_eq!(parsed.arch, Architecture::X86_64);
        assert_eq!(parsed.libc, LibcVariant::Glibc);
    }

    #[test]
    fn test_parse_musl_archive_with_alias() {
        let parsed = parse_archive_name("q-arm64-linux-musl.zip").unwrap();
        assert_eq!(parsed.name, "q");
        assert_eq!(parsed.arch, Architecture::Aarch64);
        assert_eq!(parsed.libc, LibcVariant::Musl);
    }

    #[test]
    fn test_parse_rejects_other_names() {
        assert!(parse_archive_name("q-x86_64-darwin.zip").is_none());
        assert!(parse_archive_name("q-x86_64-linux.tar.gz").is_none());
        assert!(parse_archive_name("x86_64-linux.zip").is_none());
        assert!(parse_archive_name("q-riscv64-linux.zip").is_none());
    }

    #[tokio::test]
    async fn test_resolve_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["q-x86_64-linux.zip", "q-x86_64-linux-musl.zip", "q-aarch64-linux.zip", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"zip").unwrap();
        }
        let resolver = ArtifactResolver::new(dir.path());

        let glibc = resolver.resolve(Architecture::X86_64, LibcVariant::Glibc).await.unwrap();
        assert_eq!(glibc.file_name, "q-x86_64-linux.zip");
        let musl = resolver.resolve(Architecture::X86_64, LibcVariant::Musl).await.unwrap();
        assert_eq!(musl.file_name, "q-x86_64-linux-musl.zip");

        let missing = resolver.resolve(Architecture::Aarch64, LibcVariant::Musl).await;
        assert!(matches!(missing, Err(ArtifactError::Missing { .. })));
    }

    #[tokio::test]
    async fn test_resolve_ambiguous_and_name_filter() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["q-x86_64-linux.zip", "other-x86_64-linux.zip"] {
            std::fs::write(dir.path().join(name), b"zip").unwrap();
        }

        let resolver = ArtifactResolver::new(dir.path());
        let err = resolver.resolve(Architecture::X86_64, LibcVariant::Glibc).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Ambiguous { count: 2, .. }));

        let named = ArtifactResolver::new(dir.path()).with_name(Some("q".to_string()));
        let artifact = named.resolve(Architecture::X86_64, LibcVariant::Glibc).await.unwrap();
        assert_eq!(artifact.file_name, "q-x86_64-linux.zip");
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let resolver = ArtifactResolver::new("/nonexistent/install-matrix/artifacts");
        let err = resolver.resolve(Architecture::X86_64, LibcVariant::Glibc).await.unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
    }
}
