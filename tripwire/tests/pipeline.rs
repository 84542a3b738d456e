// tripwire/tests/pipeline.rs
//
// End-to-end: token protocol through the public API, then a live TCP session
// between the server and a client agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;

use tripwire::auth::TokenAuthority;
use tripwire::client::agent::{connect, ClientConnection, ReportSink};
use tripwire::collab::{JsonlDatastore, BANS_FILE, DETECTIONS_FILE};
use tripwire::config::{Config, TokenConfig};
use tripwire::error::TokenRejection;
use tripwire::events::{ActionKind, Payload};
use tripwire::server::Server;

#[test]
fn token_window_and_replay_scenario() {
    let auth = TokenAuthority::new(Some(b"k"), &TokenConfig::default());

    let t1 = auth.issue_token_at(42, 1000).unwrap();
    assert_eq!(t1.issued_at, 1000);

    assert_eq!(auth.validate_at(42, &t1, 1010), Ok(()));
    assert_eq!(auth.replay_expiry(&t1.signature), Some(1065));

    assert_eq!(auth.validate_at(42, &t1, 1020), Err(TokenRejection::Replayed));

    let t2 = auth.issue_token_at(42, 1020).unwrap();
    assert_ne!(t2.signature, t1.signature);
    assert_eq!(auth.validate_at(42, &t2, 1020), Ok(()));

    // Someone else's token never validates for this player.
    let t3 = auth.issue_token_at(43, 1030).unwrap();
    assert_eq!(auth.validate_at(42, &t3, 1030), Err(TokenRejection::BadSignature));
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tripwire-pipeline-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

async fn start_server(out: &PathBuf) -> (Arc<Server>, SocketAddr) {
    let mut config = Config::default();
    config.persistence.output_dir = out.clone();
    config.server.metrics = None;
    let store = JsonlDatastore::new(out).unwrap();
    let server = Server::build(config, Some(b"integration-key"), None, Arc::new(store)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, addr)
}

async fn connect_player(addr: SocketAddr, id: &str) -> ClientConnection {
    connect(addr, vec![id.to_string()], Duration::from_secs(60), 64 * 1024).await.unwrap()
}

#[tokio::test]
async fn repeated_reports_escalate_to_ban_over_tcp() {
    let out = scratch_dir();
    let (server, addr) = start_server(&out).await;

    let conn = connect_player(addr, "license:cheater").await;
    for _ in 0..200 {
        if conn.agent.has_token() { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(conn.agent.has_token(), "handshake never produced a token");

    // noclip is client-asserted only: Warn, Warn, then escalation.
    for _ in 0..3 {
        conn.agent.submit("noclip".into(), Payload::new());
    }
    let reason = tokio::time::timeout(Duration::from_secs(5), conn.task)
        .await
        .expect("server never disconnected")
        .unwrap();
    assert!(reason.unwrap_or_default().starts_with("Banned"));

    assert_eq!(server.dispatcher.executed(ActionKind::Warn), 2);
    assert_eq!(server.dispatcher.executed(ActionKind::Ban), 1);
    assert!(server.bans.is_banned(&["license:cheater".into()], Utc::now()));

    // Same identifier is refused at the door.
    let again = connect_player(addr, "license:cheater").await;
    let reason = tokio::time::timeout(Duration::from_secs(5), again.task).await.unwrap().unwrap();
    assert!(reason.unwrap_or_default().starts_with("Banned"));

    // Ban and the three scored detections reach the JSONL files.
    server.persist.flush().await;
    let bans = std::fs::read_to_string(out.join(BANS_FILE)).unwrap();
    assert_eq!(bans.lines().count(), 1);
    let detections = std::fs::read_to_string(out.join(DETECTIONS_FILE)).unwrap();
    assert_eq!(detections.lines().count(), 3);

    let _ = std::fs::remove_dir_all(&out);
}

#[tokio::test]
async fn clean_resource_check_is_acked_and_keeps_session() {
    let out = scratch_dir().with_extension("clean");
    let (server, addr) = start_server(&out).await;

    let conn = connect_player(addr, "license:honest").await;
    for _ in 0..200 {
        if conn.agent.has_token() { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let player_id = conn.agent.player_id().unwrap();

    conn.agent.submit_resources(vec!["chat".into(), "hud".into()]);
    for _ in 0..200 {
        if server.dispatcher.executed(ActionKind::Allow) == 1 && conn.agent.has_token() { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.dispatcher.executed(ActionKind::Allow), 1);
    assert!(conn.agent.has_token(), "ack should carry the next token");
    assert!(server.sessions.get(player_id).is_some());

    conn.agent.goodbye();
    let reason = tokio::time::timeout(Duration::from_secs(5), conn.task).await.unwrap().unwrap();
    assert!(reason.is_none());

    let _ = std::fs::remove_dir_all(&out);
}
