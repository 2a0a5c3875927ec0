//! Shared data model for the install matrix.
//!
//! Every other crate in the workspace speaks in these types: the catalog
//! produces [`DistributionSpec`]s and [`MatrixCell`]s, the generator turns a
//! spec into an [`EnvironmentDefinition`], and the runtime builds that
//! definition into an image identified by an [`ImageTag`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors raised while parsing matrix axis values from user input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown architecture '{0}' (expected x86_64 or aarch64)")]
    Architecture(String),

    #[error("unknown libc variant '{0}' (expected glibc or musl)")]
    Libc(String),

    #[error("unknown identity '{0}' (expected root, user or both)")]
    Identity(String),

    #[error("unknown package family '{0}' (expected apt, yum or apk)")]
    PackageFamily(String),
}

/// CPU architecture of a matrix cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64", alias = "amd64")]
    X86_64,
    #[serde(rename = "aarch64", alias = "arm64")]
    Aarch64,
}

impl Architecture {
    pub const ALL: [Architecture; 2] = [Architecture::X86_64, Architecture::Aarch64];

    /// Name used in archive file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Aarch64 => "aarch64",
        }
    }

    /// Container platform string passed to the engine.
    pub fn platform(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "linux/amd64",
            Architecture::Aarch64 => "linux/arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Aarch64),
            _ => Err(ParseError::Architecture(s.to_string())),
        }
    }
}

/// C library the distributed binary links against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibcVariant {
    Glibc,
    Musl,
}

impl LibcVariant {
    pub const ALL: [LibcVariant; 2] = [LibcVariant::Glibc, LibcVariant::Musl];

    pub fn as_str(&self) -> &'static str {
        match self {
            LibcVariant::Glibc => "glibc",
            LibcVariant::Musl => "musl",
        }
    }

    /// Suffix between the architecture and `.zip` in an archive name.
    pub fn archive_suffix(&self) -> &'static str {
        match self {
            LibcVariant::Glibc => "-linux",
            LibcVariant::Musl => "-linux-musl",
        }
    }
}

impl fmt::Display for LibcVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibcVariant {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "glibc" | "gnu" => Ok(LibcVariant::Glibc),
            "musl" => Ok(LibcVariant::Musl),
            _ => Err(ParseError::Libc(s.to_string())),
        }
    }
}

/// Identity the installer runs under inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    Root,
    User,
}

impl Identity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Identity::Root => "root",
            Identity::User => "user",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which identities a run should exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySelection {
    Root,
    User,
    #[default]
    Both,
}

impl IdentitySelection {
    /// Identities in execution order; root always comes first.
    pub fn identities(&self) -> &'static [Identity] {
        match self {
            IdentitySelection::Root => &[Identity::Root],
            IdentitySelection::User => &[Identity::User],
            IdentitySelection::Both => &[Identity::Root, Identity::User],
        }
    }
}

impl FromStr for IdentitySelection {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "root" => Ok(IdentitySelection::Root),
            "user" => Ok(IdentitySelection::User),
            "both" | "all" => Ok(IdentitySelection::Both),
            _ => Err(ParseError::Identity(s.to_string())),
        }
    }
}

/// Package manager family of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFamily {
    Apt,
    #[serde(alias = "dnf")]
    Yum,
    Apk,
}

impl FromStr for PackageFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apt" | "apt-get" => Ok(PackageFamily::Apt),
            "yum" | "dnf" => Ok(PackageFamily::Yum),
            "apk" => Ok(PackageFamily::Apk),
            _ => Err(ParseError::PackageFamily(s.to_string())),
        }
    }
}

/// One distribution release under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSpec {
    pub name: String,
    pub version: String,
    pub architectures: BTreeSet<Architecture>,
    pub libc_variants: BTreeSet<LibcVariant>,
    /// Base image reference, e.g. `ubuntu:22.04`.
    pub base_image: String,
    pub package_family: PackageFamily,
    #[serde(default)]
    pub bootstrap_packages: Vec<String>,
}

impl DistributionSpec {
    pub fn supports(&self, arch: Architecture, libc: LibcVariant) -> bool {
        self.architectures.contains(&arch) && self.libc_variants.contains(&libc)
    }

    pub fn slug(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// A single test run: one distribution release, architecture, libc and identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatrixCell {
    pub distribution: String,
    pub version: String,
    pub architecture: Architecture,
    pub libc: LibcVariant,
    pub identity: Identity,
}

impl MatrixCell {
    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.distribution, self.version, self.architecture, self.libc, self.identity
        )
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Tag of a built environment image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageTag(pub String);

impl ImageTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// `source:target[:ro]` as understood by `--volume`.
    pub fn volume_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }
}

/// A file baked into the image from inline contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInjection {
    /// Absolute destination path inside the image.
    pub path: String,
    pub contents: String,
    pub mode: u32,
}

/// Generated, in-memory recipe for one environment image.
///
/// Rendering is deterministic, so [`EnvironmentDefinition::image_tag`] can be
/// used as a cache key: two definitions with the same content share a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    /// `<distribution>-<version>-<arch>`, used as the tag repository suffix.
    pub name: String,
    pub base_image: String,
    pub platform: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub setup: Vec<String>,
    pub injections: Vec<FileInjection>,
    /// Directories created empty so runtime mounts have a target.
    pub mount_points: Vec<String>,
    pub workdir: String,
    pub entrypoint: Vec<String>,
}

impl EnvironmentDefinition {
    /// File name of the n-th injection inside the build context.
    pub fn context_name(index: usize) -> String {
        format!("inject-{index}")
    }

    /// Render as a Containerfile.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("FROM {}\n", self.base_image));
        for (key, value) in &self.labels {
            out.push_str(&format!("LABEL {}={}\n", key, quote(value)));
        }
        for (key, value) in &self.env {
            out.push_str(&format!("ENV {}={}\n", key, quote(value)));
        }
        for command in &self.setup {
            out.push_str(&format!("RUN {command}\n"));
        }
        for (index, injection) in self.injections.iter().enumerate() {
            out.push_str(&format!(
                "COPY {} {}\n",
                Self::context_name(index),
                injection.path
            ));
            out.push_str(&format!("RUN chmod {:o} {}\n", injection.mode, injection.path));
        }
        if !self.mount_points.is_empty() {
            out.push_str(&format!("RUN mkdir -p {}\n", self.mount_points.join(" ")));
        }
        out.push_str(&format!("WORKDIR {}\n", self.workdir));
        let args: Vec<String> = self.entrypoint.iter().map(|arg| quote(arg)).collect();
        out.push_str(&format!("CMD [{}]\n", args.join(", ")));
        out
    }

    /// SHA-256 over the rendering, the platform and the injected contents.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hasher.update(self.platform.as_bytes());
        for injection in &self.injections {
            hasher.update(injection.path.as_bytes());
            hasher.update(injection.contents.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Content-addressed image tag.
    pub fn image_tag(&self) -> ImageTag {
        let digest = self.digest();
        ImageTag(format!("install-matrix/{}:{}", self.name, &digest[..12]))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
