//! Environment definition generator.
//!
//! Setup commands are produced by the [`PackageManager`] capability of the
//! distribution's package family, so a new distribution only needs a catalog
//! entry naming its family.

use std::collections::BTreeMap;

use matrix_shared_types::{
    Architecture, DistributionSpec, EnvironmentDefinition, FileInjection, PackageFamily,
};

/// Default unprivileged account created in every environment.
pub const DEFAULT_TEST_USER: &str = "tester";

/// Directory the archive is mounted into at run time.
pub const ARTIFACT_MOUNT: &str = "/artifacts";

/// Path of the injected verification helper.
pub const VERIFY_SCRIPT_PATH: &str = "/usr/local/bin/install-matrix-verify";

const VERIFY_SCRIPT: &str = r#"#!/bin/sh
# usage: install-matrix-verify <binary>
# Exit 1: binary not on PATH. Exit 2: --version failed. Exit 3: empty version.
binary="$1"

resolved=$(command -v "$binary") || {
    echo "$binary not found on PATH ($PATH)" >&2
    exit 1
}
echo "resolved: $resolved"

version=$("$binary" --version 2>&1) || {
    echo "$binary --version failed: $version" >&2
    exit 2
}
if [ -z "$version" ]; then
    echo "$binary --version printed nothing" >&2
    exit 3
fi
echo "version: $version"
"#;

/// Package manager capability of a distribution family.
pub trait PackageManager: Sync {
    /// Command installing `packages` non-interactively.
    fn install(&self, packages: &[String]) -> String;

    /// Command creating an unprivileged user with a home directory.
    fn create_user(&self, user: &str) -> String;

    /// Command granting `user` passwordless sudo.
    fn grant_sudo(&self, user: &str) -> String;
}

/// apt-based distributions (Debian, Ubuntu).
pub struct Apt;

/// yum/dnf-based distributions (Amazon Linux, Fedora, Rocky Linux).
pub struct Yum;

/// apk-based distributions (Alpine).
pub struct Apk;

fn sudoers_entry(user: &str) -> String {
    format!(
        "mkdir -p /etc/sudoers.d && echo '{user} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{user} && chmod 0440 /etc/sudoers.d/{user}"
    )
}

impl PackageManager for Apt {
    fn install(&self, packages: &[String]) -> String {
        format!(
            "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
            packages.join(" ")
        )
    }

    fn create_user(&self, user: &str) -> String {
        format!("useradd --create-home --shell /bin/bash {user}")
    }

    fn grant_sudo(&self, user: &str) -> String {
        format!("usermod -aG sudo {user} && {}", sudoers_entry(user))
    }
}

impl PackageManager for Yum {
    fn install(&self, packages: &[String]) -> String {
        let packages = packages.join(" ");
        format!(
            "if command -v dnf >/dev/null 2>&1; then dnf install -y --allowerasing {packages} && dnf clean all; else yum install -y {packages} && yum clean all; fi"
        )
    }

    fn create_user(&self, user: &str) -> String {
        format!("useradd --create-home --shell /bin/bash {user}")
    }

    fn grant_sudo(&self, user: &str) -> String {
        format!("usermod -aG wheel {user} && {}", sudoers_entry(user))
    }
}

impl PackageManager for Apk {
    fn install(&self, packages: &[String]) -> String {
        format!("apk add --no-cache {}", packages.join(" "))
    }

    fn create_user(&self, user: &str) -> String {
        format!("adduser -D -s /bin/sh {user}")
    }

    fn grant_sudo(&self, user: &str) -> String {
        format!("addgroup {user} wheel && {}", sudoers_entry(user))
    }
}

/// Capability implementation for a family.
pub fn package_manager(family: PackageFamily) -> &'static dyn PackageManager {
    match family {
        PackageFamily::Apt => &Apt,
        PackageFamily::Yum => &Yum,
        PackageFamily::Apk => &Apk,
    }
}

/// Turns catalog entries into environment definitions.
#[derive(Debug, Clone)]
pub struct DefinitionGenerator {
    test_user: String,
}

impl Default for DefinitionGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TEST_USER)
    }
}

impl DefinitionGenerator {
    pub fn new(test_user: impl Into<String>) -> Self {
        Self {
            test_user: test_user.into(),
        }
    }

    pub fn test_user(&self) -> &str {
        &self.test_user
    }

    /// Produce the definition for one release on one architecture.
    ///
    /// Pure: identical inputs render byte-identical definitions.
    pub fn generate(&self, spec: &DistributionSpec, arch: Architecture) -> EnvironmentDefinition {
        let manager = package_manager(spec.package_family);
        let user = self.test_user.as_str();

        let mut setup = Vec::new();
        if !spec.bootstrap_packages.is_empty() {
            setup.push(manager.install(&spec.bootstrap_packages));
        }
        setup.push(manager.create_user(user));
        setup.push(manager.grant_sudo(user));

        let labels = BTreeMap::from([
            ("install-matrix.distribution".to_string(), spec.name.clone()),
            ("install-matrix.version".to_string(), spec.version.clone()),
            ("install-matrix.architecture".to_string(), arch.to_string()),
        ]);
        let env = BTreeMap::from([("INSTALL_MATRIX_USER".to_string(), user.to_string())]);

        EnvironmentDefinition {
            name: format!("{}-{}-{}", spec.name, spec.version, arch).to_ascii_lowercase(),
            base_image: spec.base_image.clone(),
            platform: arch.platform().to_string(),
            labels,
            env,
            setup,
            injections: vec![FileInjection {
                path: VERIFY_SCRIPT_PATH.to_string(),
                contents: VERIFY_SCRIPT.to_string(),
                mode: 0o755,
            }],
            mount_points: vec![ARTIFACT_MOUNT.to_string()],
            workdir: "/".to_string(),
            entrypoint: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        }
    }
}
