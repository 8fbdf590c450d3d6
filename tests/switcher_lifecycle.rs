//! Reload, discovery and shutdown behaviour of a running switcher.

mod common;

use std::fs;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::time::Duration;

use common::{identity, key_blob, sign_request, AgentConnection, MockAgent, TestSwitcher};
use ssh_agent_switcher::protocol::MessageType;
use ssh_agent_switcher::proxy::ServerPhase;
use tempfile::TempDir;
use tokio::net::UnixStream;

#[tokio::test]
async fn reload_keeps_open_sessions_and_exposes_new_agents() {
    let root = TempDir::new().unwrap();
    let _a = MockAgent::start(root.path(), "a", vec![identity(1)]).await;
    let switcher = TestSwitcher::start(root.path()).await;

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let mut client = switcher.connect().await;
        assert_eq!(client.list_identities().await, vec![identity(1)]);
        sessions.push(client);
    }

    let b = MockAgent::start(root.path(), "b", vec![identity(2)]).await;
    let report = switcher.control.reload().await.unwrap();
    assert_eq!(report.added, vec![b.path.clone()]);
    assert_eq!(report.kept.len(), 1);
    assert!(report.dropped.is_empty());
    assert_eq!(report.identities, 2);

    for client in &mut sessions {
        assert_eq!(
            client.list_identities().await,
            vec![identity(1), identity(2)]
        );
        let reply = client.request(&sign_request(&key_blob(2))).await;
        assert_eq!(reply.payload, b.signature());
    }

    let status = switcher.control.status().await.unwrap();
    assert_eq!(status.phase, ServerPhase::Listening);
    assert_eq!(status.active_sessions, 3);
    assert_eq!(status.backends.len(), 2);
    switcher.stop().await;
}

#[tokio::test]
async fn reload_drops_agents_that_went_away() {
    let root = TempDir::new().unwrap();
    let a = MockAgent::start(root.path(), "a", vec![identity(1)]).await;
    let b = MockAgent::start(root.path(), "b", vec![identity(2)]).await;
    let switcher = TestSwitcher::start(root.path()).await;
    let version = switcher.control.status().await.unwrap().registry_version;

    let gone = b.path.clone();
    drop(b);
    fs::remove_dir_all(gone.parent().unwrap()).unwrap();

    let report = switcher.control.reload().await.unwrap();
    assert_eq!(report.kept, vec![a.path.clone()]);
    assert_eq!(report.dropped, vec![gone]);
    assert!(report.version > version);

    let mut client = switcher.connect().await;
    assert_eq!(client.list_identities().await, vec![identity(1)]);
    switcher.stop().await;
}

#[tokio::test]
async fn discovery_skips_distractors() {
    let root = TempDir::new().unwrap();
    let _a = MockAgent::start(root.path(), "real", vec![identity(1)]).await;

    // a file named like a session directory
    fs::write(root.path().join("ssh-notadir"), b"").unwrap();
    // an empty session directory
    fs::create_dir(root.path().join("ssh-empty")).unwrap();
    // a session directory holding a regular file
    let fake = root.path().join("ssh-fake");
    fs::create_dir(&fake).unwrap();
    fs::write(fake.join("agent.1"), b"").unwrap();
    // a socket nobody answers on
    let dead = root.path().join("ssh-dead");
    fs::create_dir(&dead).unwrap();
    drop(StdUnixListener::bind(dead.join("agent.1")).unwrap());

    let switcher = TestSwitcher::start(root.path()).await;
    let status = switcher.control.status().await.unwrap();
    assert_eq!(status.backends.len(), 1);
    assert_eq!(status.backends[0].identities, 1);
    switcher.stop().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_request_and_removes_socket() {
    let root = TempDir::new().unwrap();
    let a = MockAgent::start(root.path(), "a", vec![identity(1)]).await;
    let switcher = TestSwitcher::start_with(root.path(), |config| {
        config.backends.timeout_ms = 2000;
    })
    .await;
    let socket_path = switcher.socket_path.clone();
    a.set_delay(Duration::from_millis(300));

    let mut client = switcher.connect().await;
    client.send(&sign_request(&key_blob(1))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let control = switcher.control.clone();
    let stopping = tokio::spawn(switcher.stop());

    let reply = client.recv().await.expect("in-flight reply");
    assert!(reply.is(MessageType::SignResponse));
    assert_eq!(reply.payload, a.signature());
    // the session is closed after the in-flight frame
    assert!(client.recv().await.is_none());

    stopping.await.unwrap();
    assert!(!socket_path.exists());
    assert!(UnixStream::connect(&socket_path).await.is_err());
    assert!(control.status().await.is_err());
}

#[tokio::test]
async fn idle_sessions_are_closed_on_shutdown() {
    let root = TempDir::new().unwrap();
    let switcher = TestSwitcher::start(root.path()).await;
    let socket_path = switcher.socket_path.clone();

    let mut idle = AgentConnection::connect(&socket_path).await;
    assert!(idle.list_identities().await.is_empty());

    tokio::time::timeout(Duration::from_secs(1), switcher.stop())
        .await
        .expect("drain does not wait for idle clients");
    assert!(idle.recv().await.is_none());
}
