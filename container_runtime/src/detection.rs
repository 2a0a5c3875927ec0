//! Container engine detection.
//!
//! Engines are probed in priority order (Docker, Finch, Podman) by pinging
//! the Docker-compatible API on each known socket with bollard. The first
//! socket whose ping succeeds wins. Detection runs once at startup and the result is
//! passed explicitly to the runtime.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use container_runtime_interface::RuntimeError;

/// Default time allowed for a single socket probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Docker,
    Finch,
    Podman,
}

impl EngineKind {
    /// CLI binary driving the engine.
    pub fn binary(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Finch => "finch",
            EngineKind::Podman => "podman",
        }
    }

    /// Global CLI arguments pointing the binary at a specific socket.
    pub fn host_args(&self, socket: &Path) -> Vec<String> {
        let url = format!("unix://{}", socket.display());
        match self {
            EngineKind::Docker => vec!["--host".to_string(), url],
            EngineKind::Podman => vec!["--url".to_string(), url],
            // finch always talks to its own VM
            EngineKind::Finch => Vec::new(),
        }
    }

    /// Whether `build` accepts `--progress plain`.
    pub fn supports_plain_progress(&self) -> bool {
        matches!(self, EngineKind::Docker | EngineKind::Finch)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// A socket path that may belong to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketCandidate {
    pub engine: EngineKind,
    pub path: PathBuf,
}

impl SocketCandidate {
    pub fn new(engine: EngineKind, path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            path: path.into(),
        }
    }
}

/// The engine selected for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedEngine {
    pub kind: EngineKind,
    pub socket: PathBuf,
}

/// Build the ordered candidate list from explicit environment values.
pub fn candidates_from(
    docker_host: Option<&str>,
    runtime_dir: Option<&Path>,
    home: Option<&Path>,
) -> Vec<SocketCandidate> {
    let mut candidates = Vec::new();

    // Docker
    if let Some(path) = docker_host.and_then(|host| host.strip_prefix("unix://")) {
        candidates.push(SocketCandidate::new(EngineKind::Docker, path));
    }
    candidates.push(SocketCandidate::new(EngineKind::Docker, "/var/run/docker.sock"));
    if let Some(dir) = runtime_dir {
        candidates.push(SocketCandidate::new(EngineKind::Docker, dir.join("docker.sock")));
    }
    if let Some(home) = home {
        candidates.push(SocketCandidate::new(
            EngineKind::Docker,
            home.join(".docker/run/docker.sock"),
        ));
    }

    // Finch
    candidates.push(SocketCandidate::new(EngineKind::Finch, "/run/finch/finch.sock"));
    candidates.push(SocketCandidate::new(EngineKind::Finch, "/var/run/finch/finch.sock"));
    candidates.push(SocketCandidate::new(
        EngineKind::Finch,
        "/Applications/Finch/lima/data/finch/sock/finch.sock",
    ));

    // Podman
    if let Some(dir) = runtime_dir {
        candidates.push(SocketCandidate::new(EngineKind::Podman, dir.join("podman/podman.sock")));
    }
    candidates.push(SocketCandidate::new(EngineKind::Podman, "/run/podman/podman.sock"));

    candidates
}

/// Candidate list for the current process environment.
pub fn default_candidates() -> Vec<SocketCandidate> {
    let docker_host = std::env::var("DOCKER_HOST").ok();
    candidates_from(
        docker_host.as_deref(),
        dirs::runtime_dir().as_deref(),
        dirs::home_dir().as_deref(),
    )
}

/// Return the first candidate whose socket answers a ping.
pub async fn detect_engine(
    candidates: &[SocketCandidate],
    probe_timeout: Duration,
) -> Result<DetectedEngine, RuntimeError> {
    for candidate in candidates {
        if !candidate.path.exists() {
            continue;
        }
        debug!("Probing {} socket at {:?}", candidate.engine, candidate.path);
        if probe_socket(&candidate.path, probe_timeout).await {
            info!("Using {} via {:?}", candidate.engine, candidate.path);
            return Ok(DetectedEngine {
                kind: candidate.engine,
                socket: candidate.path.clone(),
            });
        }
        debug!("{} socket at {:?} did not respond", candidate.engine, candidate.path);
    }

    let tried: Vec<String> = candidates
        .iter()
        .map(|c| format!("{} ({})", c.engine, c.path.display()))
        .collect();
    Err(RuntimeError::Unavailable(format!(
        "none of the known sockets responded; tried {}",
        tried.join(", ")
    )))
}

/// Detect an engine using the default candidates and probe timeout.
pub async fn detect_local() -> Result<DetectedEngine, RuntimeError> {
    detect_engine(&default_candidates(), DEFAULT_PROBE_TIMEOUT).await
}

/// Ping the engine API listening on `path`.
#[cfg(unix)]
pub async fn probe_socket(path: &Path, probe_timeout: Duration) -> bool {
    use bollard::{Docker, API_DEFAULT_VERSION};

    let Some(socket) = path.to_str() else {
        return false;
    };
    let client = match Docker::connect_with_unix(socket, probe_timeout.as_secs().max(1), API_DEFAULT_VERSION) {
        Ok(client) => client,
        Err(e) => {
            debug!("Cannot connect to {:?}: {}", path, e);
            return false;
        }
    };

    match tokio::time::timeout(probe_timeout, client.ping()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Ping of {:?} failed: {}", path, e);
            false
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub async fn probe_socket(_path: &Path, _probe_timeout: Duration) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_priority() {
        let candidates = candidates_from(
            Some("unix:///custom/docker.sock"),
            Some(Path::new("/run/user/1000")),
            Some(Path::new("/home/dev")),
        );
        assert_eq!(candidates[0], SocketCandidate::new(EngineKind::Docker, "/custom/docker.sock"));

        let first_finch = candidates.iter().position(|c| c.engine == EngineKind::Finch).unwrap();
        let first_podman = candidates.iter().position(|c| c.engine == EngineKind::Podman).unwrap();
        let last_docker = candidates.iter().rposition(|c| c.engine == EngineKind::Docker).unwrap();
        assert!(last_docker < first_finch);
        assert!(first_finch < first_podman);
        assert!(candidates.contains(&SocketCandidate::new(
            EngineKind::Podman,
            "/run/user/1000/podman/podman.sock"
        )));
    }

    #[test]
    fn test_tcp_docker_host_ignored() {
        let candidates = candidates_from(Some("tcp://127.0.0.1:2375"), None, None);
        assert_eq!(candidates[0].path, PathBuf::from("/var/run/docker.sock"));
    }

    #[test]
    fn test_host_args() {
        let socket = Path::new("/run/podman/podman.sock");
        assert_eq!(
            EngineKind::Podman.host_args(socket),
            vec!["--url".to_string(), "unix:///run/podman/podman.sock".to_string()]
        );
        assert!(EngineKind::Finch.host_args(socket).is_empty());
    }
}
