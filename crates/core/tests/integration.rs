//! Integration test: Digest handshake then snapshot against an in-process camera.
//!
//! The camera answers the first request with a 401 Digest challenge and
//! closes; the second request must carry a valid `Authorization: Digest`
//! header and gets a JPEG back.

use std::time::Duration;

use ipcam::auth::digest::build_digest_response;
use ipcam::scan::extract_between;
use ipcam::{AuthState, CameraClient, ClientConfig, ClientEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const REALM: &str = "IP Camera(12345)";
const NONCE: &str = "5a8b1c2d3e4f";
const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0xff, 0xd9];

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.expect("read request") == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("utf-8 request head")
}

fn authorization(head: &str) -> Option<&str> {
    head.lines()
        .find_map(|line| line.strip_prefix("Authorization: "))
}

/// Checks the Digest response the way a camera would.
fn digest_is_valid(value: &str, password: &str) -> bool {
    let Some(fields) = value.strip_prefix("Digest ") else {
        return false;
    };
    let field = |name: &str| extract_between(fields, &format!("{name}=\"")).to_string();
    let nc = extract_between(fields, "nc=").to_string();
    let expected = build_digest_response(
        &field("username"),
        REALM,
        password,
        NONCE,
        &field("qop"),
        &field("cnonce"),
        &nc,
        "GET",
        &field("uri"),
    );
    field("realm") == REALM && nc == "00000001" && field("response") == expected
}

async fn run_camera(listener: TcpListener, password: &'static str) {
    // First request: no credentials, challenge it.
    let (mut stream, _) = listener.accept().await.expect("accept first");
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("GET /snapshot.jpg HTTP/1.1\r\n"), "got: {head}");
    assert!(authorization(&head).is_none());
    let challenge = format!(
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"{REALM}\", qop=\"auth\", nonce=\"{NONCE}\", opaque=\"op1\"\r\nContent-Length: 0\r\n\r\n"
    );
    stream.write_all(challenge.as_bytes()).await.expect("write 401");
    drop(stream);

    // Second request: must carry a valid digest.
    let (mut stream, _) = listener.accept().await.expect("accept second");
    let head = read_head(&mut stream).await;
    let valid = authorization(&head).is_some_and(|value| {
        value.contains("opaque=\"op1\"") && digest_is_valid(value, password)
    });
    if !valid {
        stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await
            .expect("write 403");
        return;
    }

    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        JPEG.len()
    );
    stream.write_all(reply.as_bytes()).await.expect("write head");
    // Split the body to exercise incremental assembly.
    stream.write_all(&JPEG[..3]).await.expect("write body");
    stream.flush().await.expect("flush");
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.write_all(&JPEG[3..]).await.expect("write body");
}

#[tokio::test]
async fn digest_handshake_then_snapshot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let camera = tokio::spawn(run_camera(listener, "secret"));

    let (mut client, mut events) = CameraClient::new(
        "front-door",
        "127.0.0.1",
        port,
        ClientConfig::new("admin", "secret"),
    );
    client.start();
    client.send("GET", "/snapshot.jpg").await.expect("send");

    let mut snapshots = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            ClientEvent::Snapshot { url, image } => {
                assert_eq!(url, "/snapshot.jpg");
                snapshots.push(image);
                // Let anything spurious arrive before counting.
                tokio::time::sleep(Duration::from_millis(100)).await;
                while let Ok(event) = events.try_recv() {
                    if let ClientEvent::Snapshot { image, .. } = event {
                        snapshots.push(image);
                    }
                }
                break;
            }
            ClientEvent::Status { status, .. } => panic!("camera rejected the digest: {status}"),
            ClientEvent::AuthFailed { reason, .. } => panic!("auth failed: {reason}"),
            _ => {}
        }
    }

    assert_eq!(snapshots, vec![JPEG.to_vec()]);
    assert_eq!(client.auth_state(), AuthState::DigestActive);
    camera.await.expect("camera task");
    client.dispose();
}

#[tokio::test]
async fn missing_password_reports_auth_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        read_head(&mut stream).await;
        let challenge = format!(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"{REALM}\", qop=\"auth\", nonce=\"{NONCE}\"\r\nContent-Length: 0\r\n\r\n"
        );
        stream.write_all(challenge.as_bytes()).await.expect("write 401");
    });

    let (mut client, mut events) =
        CameraClient::new("cam", "127.0.0.1", port, ClientConfig::new("admin", ""));
    client.start();
    client.send("GET", "/snapshot.jpg").await.expect("send");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time");
    assert_eq!(
        event,
        Some(ClientEvent::AuthFailed {
            url: "/snapshot.jpg".to_string(),
            reason: ipcam::AuthAbort::MissingPassword,
        })
    );
    client.dispose();
}
