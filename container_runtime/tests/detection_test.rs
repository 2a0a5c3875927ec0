//! Engine detection against fake sockets.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use container_runtime::detection::{detect_engine, probe_socket, EngineKind, SocketCandidate};
use container_runtime::RuntimeError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

/// Serve `chunks` to every connection on a new socket, pausing between
/// writes.
fn serve(path: &Path, chunks: &'static [&'static str]) {
    let listener = UnixListener::bind(path).expect("bind fake engine socket");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                for chunk in chunks {
                    let _ = stream.write_all(chunk.as_bytes()).await;
                    let _ = stream.flush().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
        }
    });
}

const OK: &[&str] = &["HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK"];
const BROKEN: &[&str] = &["HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"];

#[tokio::test]
async fn test_first_responding_engine_wins() {
    let dir = tempfile::tempdir().unwrap();
    let docker = dir.path().join("docker.sock");
    let podman = dir.path().join("podman.sock");
    serve(&docker, OK);
    serve(&podman, OK);

    let candidates = vec![
        SocketCandidate::new(EngineKind::Docker, &docker),
        SocketCandidate::new(EngineKind::Podman, &podman),
    ];
    let engine = detect_engine(&candidates, Duration::from_secs(1)).await.unwrap();
    assert_eq!(engine.kind, EngineKind::Docker);
    assert_eq!(engine.socket, docker);
}

#[tokio::test]
async fn test_unhealthy_engine_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let docker = dir.path().join("docker.sock");
    let finch = dir.path().join("finch.sock");
    serve(&docker, BROKEN);
    serve(&finch, OK);

    let candidates = vec![
        SocketCandidate::new(EngineKind::Docker, &docker),
        SocketCandidate::new(EngineKind::Docker, dir.path().join("missing.sock")),
        SocketCandidate::new(EngineKind::Finch, &finch),
    ];
    let engine = detect_engine(&candidates, Duration::from_secs(1)).await.unwrap();
    assert_eq!(engine.kind, EngineKind::Finch);
}

#[tokio::test]
async fn test_no_engine_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let candidates = vec![SocketCandidate::new(EngineKind::Podman, dir.path().join("podman.sock"))];
    let err = detect_engine(&candidates, Duration::from_millis(200)).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Unavailable(_)));
    assert!(err.to_string().contains("podman"));
}

#[tokio::test]
async fn test_silent_socket_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("silent.sock");
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    assert!(!probe_socket(&path, Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_response_split_across_writes() {
    let dir = tempfile::tempdir().unwrap();
    let docker = dir.path().join("docker.sock");
    serve(
        &docker,
        &["HTTP/1.1 ", "200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK"],
    );

    assert!(probe_socket(&docker, Duration::from_secs(1)).await);
}
