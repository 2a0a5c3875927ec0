//! Install phase command sequences.
//!
//! A phase extracts the archive, runs the installer and verifies the
//! installed binary, all under one identity. The privileged phase passes the
//! force flag and the root-install environment; the unprivileged phase only
//! skips confirmation.

use container_runtime_interface::ExecRequest;
use environment_catalog::{ResolvedArtifact, ARTIFACT_MOUNT, VERIFY_SCRIPT_PATH};
use matrix_shared_types::Identity;

use crate::config::InstallerContract;

/// Directory under `$HOME` the archive is extracted into.
const WORK_DIR: &str = "install-matrix";

/// One exec within a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseStep {
    pub name: &'static str,
    pub request: ExecRequest,
}

/// Account name and home directory used for an identity.
pub fn account(identity: Identity, test_user: &str) -> (String, String) {
    match identity {
        Identity::Root => ("root".to_string(), "/root".to_string()),
        Identity::User => (test_user.to_string(), format!("/home/{test_user}")),
    }
}

/// Archive path inside the container.
pub fn archive_path(artifact: &ResolvedArtifact) -> String {
    format!("{}/{}", ARTIFACT_MOUNT, artifact.file_name)
}

/// Build the ordered steps of one phase.
pub fn phase_steps(
    identity: Identity,
    artifact: &ResolvedArtifact,
    installer: &InstallerContract,
    test_user: &str,
) -> Vec<PhaseStep> {
    let (user, home) = account(identity, test_user);
    let request = |script: String| ExecRequest::new(script, &user, &home).with_env("HOME", &home);

    let extract = format!(
        "rm -rf \"$HOME/{WORK_DIR}\" && mkdir -p \"$HOME/{WORK_DIR}\" && cd \"$HOME/{WORK_DIR}\" && unzip -q -o '{}'",
        archive_path(artifact)
    );

    let mut flags = Vec::new();
    if identity == Identity::Root {
        flags.push(installer.force_flag.as_str());
    }
    flags.push(installer.no_confirm_flag.as_str());
    let install = format!(
        "cd \"$HOME/{WORK_DIR}/{}\" && ./{} {}",
        installer.bundle_dir,
        installer.installer,
        flags.join(" ")
    );
    let mut install_request = request(install);
    if identity == Identity::Root {
        for (key, value) in &installer.root_env {
            install_request = install_request.with_env(key, value);
        }
    }

    let verify = format!("{} {}", VERIFY_SCRIPT_PATH, installer.binary);

    vec![
        PhaseStep {
            name: "extract",
            request: request(extract),
        },
        PhaseStep {
            name: "install",
            request: install_request,
        },
        PhaseStep {
            name: "verify",
            request: request(verify),
        },
    ]
}
