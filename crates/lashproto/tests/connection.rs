//! Connection-level integration over real Unix sockets.

#![cfg(unix)]

use lashproto::{
    conn::Connection,
    event::{CommEvent, Config, ConnectParams, ProtocolVersion},
    wire, PROTOCOL_VERSION,
};
use tokio::net::UnixStream;
use uuid::Uuid;

#[tokio::test]
async fn handshake_then_connect_exchange() {
    let (mut client_sock, mut daemon_sock) = UnixStream::pair().unwrap();

    let client = tokio::spawn(async move {
        let peer = wire::handshake(&mut client_sock).await.unwrap();
        assert_eq!(peer, PROTOCOL_VERSION);

        let params = ConnectParams {
            protocol_version: PROTOCOL_VERSION,
            flags: 0,
            project: "demo".into(),
            working_dir: "/tmp".into(),
            class: "synth".into(),
            id: Uuid::new_v4(),
            argv: vec!["synth".into()],
        };
        wire::write_event(&mut client_sock, &CommEvent::Connect(params.clone()))
            .await
            .unwrap();

        let mut conn = Connection::spawn(client_sock);
        conn.send(CommEvent::Config(Config::new("gain", vec![0, 0, 128, 63])))
            .await
            .unwrap();
        conn.close().await;
        params
    });

    wire::handshake(&mut daemon_sock).await.unwrap();
    let connect = wire::read_event(&mut daemon_sock)
        .await
        .unwrap()
        .into_connect()
        .expect("first event after handshake is Connect");
    assert_eq!(connect.project, "demo");
    assert_eq!(connect.class, "synth");

    let mut conn = Connection::spawn(daemon_sock);
    let config = conn.recv_config().await.unwrap();
    assert_eq!(config.key, "gain");
    assert_eq!(config.value, vec![0, 0, 128, 63]);

    // Client closed; our queues terminate and both tasks join.
    assert!(conn.recv_config().await.is_none());
    conn.join().await;

    let sent = client.await.unwrap();
    assert_eq!(sent.project, connect.project);
    assert_eq!(sent.id, connect.id);
}

#[tokio::test]
async fn version_gate_closes_both_sides() {
    let (mut newer_sock, mut older_sock) = UnixStream::pair().unwrap();
    let newer = ProtocolVersion { major: 3, minor: 0 };
    let older = ProtocolVersion { major: 2, minor: 0 };

    let (newer_res, older_res) = tokio::join!(
        wire::handshake_as(&mut newer_sock, newer),
        wire::handshake_as(&mut older_sock, older),
    );

    assert!(newer_res.is_err());
    // The behind side learns the ahead side's version from the
    // ProtocolMismatch event it received before the close.
    match older_res.unwrap_err() {
        lashproto::ProtoError::VersionMismatch { ours, theirs } => {
            assert_eq!(ours, older);
            assert_eq!(theirs, newer);
        }
        other => panic!("expected VersionMismatch, got {other}"),
    }

    // Sockets are dropped by the callers after the gate; a subsequent read
    // on either end reports closed, not a protocol error.
    drop(newer_sock);
    let err = wire::read_event(&mut older_sock).await.unwrap_err();
    assert!(err.is_disconnect());
}
