//! Integration tests for Backhaul
//!
//! Tests the full client-server tunnel flow including:
//! - Connection-ID preamble handshake
//! - End-to-end byte relay through both nodes
//! - PROXY header emission toward the backend
//! - Queueing across a tunnel outage and reconnect
//! - The HTTP control plane against a live socket

use backhaul::control;
use backhaul::ip::{Discovery, IpMonitor, Notifier};
use backhaul::listener::{Context, Listener, ListenerRole};
use backhaul::routes::RouteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn temp_routes_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "backhaul-it-{}-{}.json",
        std::process::id(),
        name
    ))
}

/// Write a routes.json with one route and load a store from it
fn store_with_route(
    file: &str,
    route_id: &str,
    haproxy: &str,
    backend_ip: &str,
    backend_port: u16,
) -> (Arc<RouteStore>, PathBuf) {
    let path = temp_routes_file(file);
    let content = format!(
        r#"[{{"route_id":"{}","bind_ip":"127.0.0.1","bind_port":0,"haproxy":"{}","backend_ip":"{}","backend_port":{}}}]"#,
        route_id, haproxy, backend_ip, backend_port
    );
    std::fs::write(&path, content).unwrap();
    (Arc::new(RouteStore::load(&path).unwrap()), path)
}

/// Boot a public-entry (client-side) listener whose tunnel target is `peer_port`
async fn start_client_node(name: &str, peer_port: u16) -> (std::net::SocketAddr, PathBuf) {
    let (store, path) = store_with_route(name, "route", "off", "127.0.0.1", peer_port);
    let ctx = Context::new(Arc::clone(&store));
    let route = store.get("route").unwrap();

    let listener = Listener::bind(route, ListenerRole::PublicEntry, ctx)
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());
    (addr, path)
}

/// Boot a tunnel-entry (server-side) listener that forwards to `backend_port`
async fn start_server_node(
    name: &str,
    haproxy: &str,
    backend_port: u16,
) -> (std::net::SocketAddr, Arc<Context>, PathBuf) {
    let (store, path) = store_with_route(name, "route", haproxy, "127.0.0.1", backend_port);
    let ctx = Context::new(Arc::clone(&store));
    let route = store.get("route").unwrap();

    let listener = Listener::bind(route, ListenerRole::TunnelEntry, Arc::clone(&ctx))
        .await
        .unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());
    (addr, ctx, path)
}

/// The first egress bytes of a fresh flow are exactly one preamble line
/// carrying a 32-hex connection ID and the user's address tuple
#[tokio::test]
async fn test_preamble_is_first_on_the_wire() {
    // A bare acceptor stands in for the server node
    let fake_server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = fake_server.local_addr().unwrap().port();

    let (client_addr, path) = start_client_node("preamble", server_port).await;

    let mut user = TcpStream::connect(client_addr).await.unwrap();
    let user_port = user.local_addr().unwrap().port();
    user.write_all(b"HELLO").await.unwrap();

    let (mut tunnel_conn, _) = fake_server.accept().await.unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.ends_with(b"HELLO") {
        let n = tunnel_conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "tunnel connection closed early");
        received.extend_from_slice(&buf[..n]);
    }

    let newline = received.iter().position(|&b| b == b'\n').unwrap();
    let line = std::str::from_utf8(&received[..newline]).unwrap();

    let body = line.strip_prefix("TUNNELLED_ID:").unwrap();
    let (id, rest) = body.split_once('|').unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
        rest,
        format!(
            "PROXY_INFO:127.0.0.1:{}->127.0.0.1:{}",
            user_port,
            client_addr.port()
        )
    );

    // User bytes follow the preamble, never precede it
    assert_eq!(&received[newline + 1..], b"HELLO");

    let _ = std::fs::remove_file(path);
}

/// Full chain: user -> client node -> server node -> backend, and back
#[tokio::test]
async fn test_end_to_end_relay() {
    // Final backend: reads a ping, answers a pong, then holds the
    // connection open until the far side hangs up
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest).await;
    });

    let (server_addr, server_ctx, server_path) =
        start_server_node("e2e-server", "off", backend_port).await;
    let (client_addr, client_path) = start_client_node("e2e-client", server_addr.port()).await;

    let mut user = TcpStream::connect(client_addr).await.unwrap();
    user.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    user.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    // The flow is registered on the server for as long as the user stays
    assert_eq!(server_ctx.flows.len(), 1);

    drop(user);
    // Teardown propagates to the registry
    for _ in 0..50 {
        if server_ctx.flows.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(server_ctx.flows.is_empty());

    let _ = std::fs::remove_file(server_path);
    let _ = std::fs::remove_file(client_path);
}

/// With haproxy=v1 on the server route, the backend sees a PROXY line
/// carrying the original user's address before any payload
#[tokio::test]
async fn test_backend_receives_proxy_header() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();

    let backend_task = tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.ends_with(b"payload") {
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    let (server_addr, _server_ctx, server_path) =
        start_server_node("proxy-server", "v1", backend_port).await;
    let (client_addr, client_path) = start_client_node("proxy-client", server_addr.port()).await;

    let mut user = TcpStream::connect(client_addr).await.unwrap();
    let user_port = user.local_addr().unwrap().port();
    user.write_all(b"payload").await.unwrap();

    let received = backend_task.await.unwrap();
    let expected_header = format!(
        "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
        user_port,
        client_addr.port()
    );
    assert!(
        received.starts_with(expected_header.as_bytes()),
        "backend got: {:?}",
        String::from_utf8_lossy(&received)
    );
    assert_eq!(&received[expected_header.len()..], b"payload");

    let _ = std::fs::remove_file(server_path);
    let _ = std::fs::remove_file(client_path);
}

/// A tunnel connection that never identifies itself is closed, and a
/// duplicate connection ID is refused
#[tokio::test]
async fn test_server_rejects_bad_and_duplicate_ids() {
    // Backend that accepts and holds connections open
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (conn, _) = backend.accept().await.unwrap();
            held.push(conn);
        }
    });

    let (server_addr, server_ctx, server_path) =
        start_server_node("reject", "off", backend_port).await;

    // Garbage instead of a preamble: connection gets closed
    let mut bogus = TcpStream::connect(server_addr).await.unwrap();
    bogus.write_all(b"NOT A PREAMBLE\n").await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(bogus.read(&mut buf).await.unwrap(), 0);
    assert!(server_ctx.flows.is_empty());

    // First tunnel registers its ID and stays up
    let preamble = b"TUNNELLED_ID:cafebabecafebabecafebabecafebabe\n";
    let mut first = TcpStream::connect(server_addr).await.unwrap();
    first.write_all(preamble).await.unwrap();
    for _ in 0..50 {
        if server_ctx.flows.len() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(server_ctx.flows.len(), 1);

    // A second tunnel claiming the live ID is refused and closed
    let mut second = TcpStream::connect(server_addr).await.unwrap();
    second.write_all(preamble).await.unwrap();
    assert_eq!(second.read(&mut buf).await.unwrap(), 0);
    assert_eq!(server_ctx.flows.len(), 1);

    let _ = std::fs::remove_file(server_path);
}

/// Bytes sent while the tunnel leg is down are queued and delivered after
/// the reconnect, behind a fresh preamble
#[tokio::test]
async fn test_queue_across_tunnel_outage() {
    // Reserve a port for the server node, but don't listen yet
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let (client_addr, client_path) = start_client_node("outage", server_port).await;

    // User connects while the server side is down; the dial fails and the
    // first reconnect is due in one second
    let mut user = TcpStream::connect(client_addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    user.write_all(b"early ").await.unwrap();
    user.write_all(b"bytes").await.unwrap();

    // Server side comes up on the reserved port before the retry fires
    let server = TcpListener::bind(("127.0.0.1", server_port)).await.unwrap();

    let (mut tunnel_conn, _) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        server.accept(),
    )
    .await
    .expect("client never reconnected")
    .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !received.ends_with(b"early bytes") {
        let n = tunnel_conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "tunnel closed before backlog arrived");
        received.extend_from_slice(&buf[..n]);
    }

    // Preamble first, then the queued bytes in order
    let newline = received.iter().position(|&b| b == b'\n').unwrap();
    assert!(received.starts_with(b"TUNNELLED_ID:"));
    assert_eq!(&received[newline + 1..], b"early bytes");

    let _ = std::fs::remove_file(client_path);
}

/// Control plane: health, bearer auth, IP updates, bind updates, and the
/// on-disk effects
#[tokio::test]
async fn test_control_plane() {
    let path = temp_routes_file("control");
    std::fs::write(
        &path,
        r#"[
            {"route_id":"R1","bind_ip":"127.0.0.1","bind_port":1001,"haproxy":"off","backend_ip":"1.1.1.1","backend_port":70},
            {"route_id":"R2","bind_ip":"127.0.0.1","bind_port":1002,"haproxy":"off","backend_ip":"2.2.2.2","backend_port":70}
        ]"#,
    )
    .unwrap();
    let store = Arc::new(RouteStore::load(&path).unwrap());

    let app = control::router(Arc::clone(&store), "sekrit");
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", http.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    // Health is open and well-formed
    let health: serde_json::Value = client
        .get(format!("{}/api/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["timestamp"].is_string());

    // No bearer: rejected, nothing changes
    let resp = client
        .post(format!("{}/api/ip/update", base))
        .json(&serde_json::json!({"endpoints": ["R1"], "new-ip": "9.9.9.9"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(
        store.get("R1").unwrap().read().unwrap().backend_ip,
        "1.1.1.1"
    );

    // Correct bearer: R1 updated, unknown R3 skipped, R2 untouched
    let resp = client
        .post(format!("{}/api/ip/update", base))
        .header("Authorization", "Bearer sekrit")
        .json(&serde_json::json!({"endpoints": ["R1", "R3"], "new-ip": "9.9.9.9"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "updated 1 routes");

    assert_eq!(
        store.get("R1").unwrap().read().unwrap().backend_ip,
        "9.9.9.9"
    );
    assert_eq!(
        store.get("R2").unwrap().read().unwrap().backend_ip,
        "2.2.2.2"
    );

    // The change hit the disk before the response returned
    let on_disk = std::fs::read_to_string(&path).unwrap();
    assert!(on_disk.contains("9.9.9.9"));
    assert!(on_disk.contains("2.2.2.2"));

    // Bind update on an unknown route
    let resp = client
        .post(format!("{}/update", base))
        .header("Authorization", "Bearer sekrit")
        .json(&serde_json::json!({"route_id": "nope", "ip": "0.0.0.0", "port": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Bind update on a known route persists
    let resp = client
        .post(format!("{}/update", base))
        .header("Authorization", "Bearer sekrit")
        .json(&serde_json::json!({"route_id": "R2", "ip": "0.0.0.0", "port": 2002}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let route = store.get("R2").unwrap();
    assert_eq!(route.read().unwrap().bind_ip, "0.0.0.0");
    assert_eq!(route.read().unwrap().bind_port, 2002);

    let _ = std::fs::remove_file(path);
}

/// The monitor loop against live HTTP: a discovery endpoint hands out the
/// server's public IP, the notifier pushes it to the control plane, and
/// the client's routes end up pointing at the new address
#[tokio::test]
async fn test_ip_change_notification_updates_routes() {
    let path = temp_routes_file("ipmon");
    std::fs::write(
        &path,
        r#"[{"route_id":"R1","bind_ip":"127.0.0.1","bind_port":1001,"haproxy":"off","backend_ip":"1.1.1.1","backend_port":70}]"#,
    )
    .unwrap();
    let store = Arc::new(RouteStore::load(&path).unwrap());

    // Client-side control plane
    let app = control::router(Arc::clone(&store), "sekrit");
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_base = format!("http://{}", http.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    // Stand-in for the public discovery endpoint
    let discovery_app =
        axum::Router::new().route("/", axum::routing::get(|| async { "203.0.113.9\n" }));
    let discovery_http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let discovery_base = format!("http://{}", discovery_http.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(discovery_http, discovery_app).await.unwrap();
    });

    let notifier = Notifier::new(&control_base, "sekrit");
    notifier.probe().await.unwrap();

    let mut monitor = IpMonitor::new(
        Discovery::with_endpoint(&discovery_base),
        notifier,
        300,
    );

    // First reading always counts as a change and gets delivered
    let changed = monitor.tick(&store).await.unwrap();
    assert_eq!(changed.as_deref(), Some("203.0.113.9"));
    assert_eq!(
        store.get("R1").unwrap().read().unwrap().backend_ip,
        "203.0.113.9"
    );
    assert!(std::fs::read_to_string(&path).unwrap().contains("203.0.113.9"));

    // Same reading again: no change, no push
    assert!(monitor.tick(&store).await.unwrap().is_none());

    let _ = std::fs::remove_file(path);
}
