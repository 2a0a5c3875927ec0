//! `EngineCliRuntime` against a shell script standing in for the engine CLI.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use container_runtime::{
    ContainerHandle, ContainerRuntime, CreateContainerOptions, DetectedEngine, EngineCliConfig,
    EngineCliRuntime, EngineKind, ExecRequest, RuntimeError,
};
use container_runtime_interface::{EnvironmentDefinition, ImageTag};
use tokio_util::sync::CancellationToken;

const FAKE_ENGINE: &str = r##"#!/bin/sh
D='@STATE@'
echo "$*" >> "$D/calls.log"
case "$1" in
  version)
    echo "fake-engine 1.0"
    exit 0 ;;
  image)
    [ -f "$D/built" ] && exit 0
    echo "Error: No such image" >&2
    exit 1 ;;
  build)
    [ -f "$D/build-delay" ] && sleep "$(cat "$D/build-delay")"
    echo "#1 FROM docker.io/library/alpine:3.19"
    if [ -f "$D/fail-build" ]; then
      echo "ERROR: unable to select packages: unzip (no such package)" >&2
      exit 1
    fi
    touch "$D/built"
    exit 0 ;;
  run)
    if [ -f "$D/fail-run" ]; then
      echo "exec /usr/bin/tail: exec format error" >&2
      exit 125
    fi
    echo "cid-$$"
    exit 0 ;;
  exec)
    if [ -f "$D/exec-broken" ]; then
      echo "Error response from daemon: container is not running" >&2
      exit 126
    fi
    for last; do :; done
    sh -c "$last"
    exit $? ;;
  logs)
    echo "container log line"
    exit 0 ;;
  rm)
    if [ "$3" = "gone" ]; then
      echo "Error response from daemon: No such container: gone" >&2
      exit 1
    fi
    exit 0 ;;
esac
echo "unknown command $1" >&2
exit 1
"##;

/// A fake engine binary plus the directory holding its state.
struct FakeEngine {
    dir: tempfile::TempDir,
}

impl FakeEngine {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = FAKE_ENGINE.replace("@STATE@", &dir.path().display().to_string());
        let binary = dir.path().join("engine");
        std::fs::write(&binary, script).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Drop a marker file switching on one of the script's failure modes.
    fn set(&self, marker: &str, contents: &str) {
        std::fs::write(self.path().join(marker), contents).unwrap();
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(command)).count()
    }

    async fn runtime(&self) -> EngineCliRuntime {
        let engine = DetectedEngine {
            kind: EngineKind::Finch,
            socket: PathBuf::from("/run/finch/finch.sock"),
        };
        let config = EngineCliConfig {
            binary: Some(self.path().join("engine")),
            command_timeout: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        EngineCliRuntime::new(engine, config).await.unwrap()
    }
}

fn definition() -> EnvironmentDefinition {
    EnvironmentDefinition {
        name: "alpine-3.19-x86_64".to_string(),
        base_image: "alpine:3.19".to_string(),
        platform: "linux/amd64".to_string(),
        labels: BTreeMap::new(),
        env: BTreeMap::new(),
        setup: vec!["apk add --no-cache unzip".to_string()],
        injections: Vec::new(),
        mount_points: Vec::new(),
        workdir: "/".to_string(),
        entrypoint: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
    }
}

fn options() -> CreateContainerOptions {
    CreateContainerOptions {
        cell: "alpine-3.19-x86_64-musl-root".to_string(),
        ..Default::default()
    }
}

async fn running(runtime: &EngineCliRuntime) -> ContainerHandle {
    let image = runtime.build_image(&definition()).await.unwrap();
    runtime.run_container(&image, &options()).await.unwrap()
}

#[tokio::test]
async fn test_build_failure_keeps_output_tail() {
    let engine = FakeEngine::new();
    engine.set("fail-build", "");
    let runtime = engine.runtime().await;

    let err = runtime.build_image(&definition()).await.unwrap_err();
    match err {
        RuntimeError::BuildFailed { tag, output, .. } => {
            assert_eq!(tag, definition().image_tag().to_string());
            assert!(output.contains("#1 FROM"));
            assert!(output.contains("unable to select packages"));
        }
        other => panic!("expected BuildFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cached_image_is_not_rebuilt() {
    let engine = FakeEngine::new();
    let runtime = engine.runtime().await;

    let first = runtime.build_image(&definition()).await.unwrap();
    let second = runtime.build_image(&definition()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.count("build "), 1);
}

#[tokio::test]
async fn test_concurrent_builds_of_one_tag_share_a_build() {
    let engine = FakeEngine::new();
    engine.set("build-delay", "0.3");
    let runtime = Arc::new(engine.runtime().await);

    let (def_a, def_b) = (definition(), definition());
    let (a, b) = tokio::join!(
        runtime.build_image(&def_a),
        runtime.build_image(&def_b),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(engine.count("build "), 1);
}

#[tokio::test]
async fn test_failed_start_removes_the_container() {
    let engine = FakeEngine::new();
    engine.set("fail-run", "");
    let runtime = engine.runtime().await;
    let image = ImageTag("install-matrix/alpine-3.19-x86_64:0123456789ab".to_string());

    let err = runtime.run_container(&image, &options()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    assert!(err.to_string().contains("exec format error"));

    let calls = engine.calls();
    let run = calls.iter().find(|call| call.starts_with("run ")).unwrap();
    let name = run.split_whitespace().nth(3).unwrap();
    assert!(name.starts_with("install-matrix-alpine-3.19-x86_64-musl-root-"));
    assert!(calls.contains(&format!("rm --force {name}")));
    assert_eq!(runtime.teardown_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_exec_non_zero_exit_is_a_result() {
    let engine = FakeEngine::new();
    let runtime = engine.runtime().await;
    let handle = running(&runtime).await;

    let request = ExecRequest::new("echo out; echo err >&2; exit 3", "root", "/root");
    let output = runtime
        .exec(&handle, &request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.stderr.trim(), "err");
}

#[tokio::test]
async fn test_undispatched_exec_is_an_error() {
    let engine = FakeEngine::new();
    let runtime = engine.runtime().await;
    let handle = running(&runtime).await;
    engine.set("exec-broken", "");

    let request = ExecRequest::new("true", "root", "/root");
    let err = runtime
        .exec(&handle, &request, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        RuntimeError::CommandFailed { message, .. } => assert!(message.contains("not running")),
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_teardown_of_missing_container_succeeds() {
    let engine = FakeEngine::new();
    let runtime = engine.runtime().await;
    let handle = ContainerHandle {
        id: "gone".to_string(),
        name: "install-matrix-gone".to_string(),
        image: ImageTag("install-matrix/alpine-3.19-x86_64:0123456789ab".to_string()),
        cell: "alpine-3.19-x86_64-musl-root".to_string(),
    };

    runtime.teardown(&handle).await.unwrap();
    assert!(engine.calls().contains(&"rm --force gone".to_string()));
}

#[tokio::test]
async fn test_teardown_all_sweeps_live_containers() {
    let engine = FakeEngine::new();
    let runtime = engine.runtime().await;
    let first = running(&runtime).await;
    let second = running(&runtime).await;
    let kept = running(&runtime).await;
    runtime.retain(&kept).await;

    assert_eq!(runtime.teardown_all().await.unwrap(), 2);
    let calls = engine.calls();
    assert!(calls.contains(&format!("rm --force {}", first.id)));
    assert!(calls.contains(&format!("rm --force {}", second.id)));
    assert!(!calls.contains(&format!("rm --force {}", kept.id)));
    assert_eq!(runtime.teardown_all().await.unwrap(), 0);
}
