//! End-to-end session scenarios against a real daemon on a Unix socket.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lashconf::LashConfig;
use lashd::{InMemoryGraph, SessionServer};
use lashproto::{
    wire, CommEvent, Config, Connection, ConnectParams, Event, EventKind, PROTOCOL_VERSION,
};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct TestDaemon {
    server: Arc<SessionServer>,
    socket: PathBuf,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("socket");
    let config = LashConfig {
        paths: lashconf::PathsConfig {
            socket: socket.clone(),
            projects_dir: dir.path().join("projects"),
        },
        log: Default::default(),
    };

    let server = SessionServer::new(config, Arc::new(InMemoryGraph::new()));
    let shutdown = CancellationToken::new();
    tokio::spawn(server.clone().run(shutdown.clone()));

    // Wait for the listener to come up.
    for _ in 0..100 {
        if UnixStream::connect(&socket).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    TestDaemon {
        server,
        socket,
        shutdown,
        _dir: dir,
    }
}

async fn connect_client(socket: &PathBuf, params: &ConnectParams) -> Connection {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    wire::handshake(&mut stream).await.unwrap();
    wire::write_event(&mut stream, &CommEvent::Connect(params.clone()))
        .await
        .unwrap();
    Connection::spawn(stream)
}

fn synth_params(project: &str, id: Uuid) -> ConnectParams {
    ConnectParams {
        protocol_version: PROTOCOL_VERSION,
        flags: 0,
        project: project.into(),
        working_dir: "/tmp".into(),
        class: "synth".into(),
        id,
        argv: vec!["synth".into(), "--preset".into(), "warm".into()],
    }
}

/// Poll until the condition holds or a couple of seconds pass.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn client_lifecycle_retains_last_known_state() {
    let daemon = start_daemon().await;
    let u1 = Uuid::new_v4();

    let mut conn = connect_client(&daemon.socket, &synth_params("demo", u1)).await;

    // Daemon records Client U1 under Project "demo".
    let registry = daemon.server.registry();
    wait_for(|| {
        registry
            .find_project("demo")
            .map(|p| p.find_client(u1).is_some())
            .unwrap_or(false)
    })
    .await;

    let client = registry.find_project("demo").unwrap().find_client(u1).unwrap();
    assert_eq!(client.class(), "synth");
    wait_for(|| client.is_connected()).await;

    // A config flows into the daemon's inbound configs queue, bit-exact.
    conn.send(CommEvent::Config(Config::new("gain", vec![0, 0, 128, 63])))
        .await
        .unwrap();
    wait_for(|| client.configs().contains_key("gain")).await;
    assert_eq!(client.configs()["gain"], vec![0, 0, 128, 63]);

    // Disconnect: reported no-longer-running, but the record and its last
    // config survive in the project.
    conn.close().await;
    wait_for(|| !client.is_connected()).await;

    let project = registry.find_project("demo").unwrap();
    assert!(project.find_client(u1).is_some());
    assert_eq!(project.find_client(u1).unwrap().configs()["gain"], vec![0, 0, 128, 63]);

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn save_event_writes_project_file() {
    let daemon = start_daemon().await;
    let u1 = Uuid::new_v4();

    let mut client_conn = connect_client(&daemon.socket, &synth_params("demo", u1)).await;
    client_conn
        .send(CommEvent::Config(Config::new("gain", vec![1])))
        .await
        .unwrap();

    let registry = daemon.server.registry();
    wait_for(|| {
        registry
            .find_project("demo")
            .and_then(|p| p.find_client(u1))
            .map(|c| c.configs().contains_key("gain"))
            .unwrap_or(false)
    })
    .await;

    // A client may request the save itself.
    client_conn
        .send(CommEvent::Event(Event::new(EventKind::Save, "demo")))
        .await
        .unwrap();

    let project_dir = registry.find_project("demo").unwrap().directory();
    wait_for(|| project_dir.join("project.json").exists()).await;

    let saved = lashd::persist::load_project(&project_dir).unwrap();
    assert_eq!(saved.name, "demo");
    assert_eq!(saved.clients.len(), 1);
    assert_eq!(saved.clients[0].id, u1);
    assert_eq!(saved.clients[0].argv, vec!["synth", "--preset", "warm"]);
    assert_eq!(saved.clients[0].configs["gain"], vec![1]);

    // The daemon notified the client to dump its state.
    let notify = client_conn.recv_event().await.unwrap();
    assert_eq!(notify.kind, EventKind::Save);
    assert_eq!(notify.client_id, u1);

    client_conn.close().await;
    daemon.shutdown.cancel();
}

#[tokio::test]
async fn interface_quit_tears_down_project_and_notifies_clients() {
    let daemon = start_daemon().await;
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();

    let mut a = connect_client(&daemon.socket, &synth_params("demo", u1)).await;
    let mut b = connect_client(&daemon.socket, &synth_params("demo", u2)).await;

    let registry = daemon.server.registry();
    wait_for(|| {
        registry
            .find_project("demo")
            .map(|p| p.client_count() == 2)
            .unwrap_or(false)
    })
    .await;

    // A GUI peer issues the quit.
    let mut iface_stream = UnixStream::connect(&daemon.socket).await.unwrap();
    wire::handshake(&mut iface_stream).await.unwrap();
    wire::write_event(&mut iface_stream, &CommEvent::IfaceConnect)
        .await
        .unwrap();
    let iface = Connection::spawn(iface_stream);
    iface
        .send(CommEvent::Event(Event::new(EventKind::Quit, "demo")))
        .await
        .unwrap();

    // Both clients are told to quit, then the project disappears.
    let quit_a = a.recv_event().await.unwrap();
    assert_eq!(quit_a.kind, EventKind::Quit);
    let quit_b = b.recv_event().await.unwrap();
    assert_eq!(quit_b.kind, EventKind::Quit);

    wait_for(|| registry.find_project("demo").is_none()).await;

    a.close().await;
    b.close().await;
    daemon.shutdown.cancel();
}

#[tokio::test]
async fn version_skewed_client_is_rejected() {
    let daemon = start_daemon().await;

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let old = lashproto::ProtocolVersion { major: 1, minor: 0 };
    let err = wire::handshake_as(&mut stream, old).await.unwrap_err();
    match err {
        lashproto::ProtoError::VersionMismatch { theirs, .. } => {
            assert_eq!(theirs, PROTOCOL_VERSION);
        }
        other => panic!("expected version mismatch, got {other}"),
    }

    // The daemon is unharmed: a well-versioned client still connects.
    let u1 = Uuid::new_v4();
    let mut conn = connect_client(&daemon.socket, &synth_params("demo", u1)).await;
    wait_for(|| daemon.server.registry().find_project("demo").is_some()).await;
    conn.close().await;
    daemon.shutdown.cancel();
}
