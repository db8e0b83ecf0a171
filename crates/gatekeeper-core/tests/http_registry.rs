//! HTTP registry client against a loopback stub server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gatekeeper_core::{HttpRegistryClient, PlateAuthorizer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Clone)]
enum Behaviour {
    Reply { status: &'static str, body: &'static str },
    Hang,
}

struct Stub {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn stub(behaviour: Behaviour) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let behaviour = behaviour.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&buf);
                if let Some(line) = head.lines().next() {
                    seen.lock().unwrap().push(line.to_string());
                }
                match behaviour {
                    Behaviour::Reply { status, body } => {
                        let response = format!(
                            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                            body.len()
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    Behaviour::Hang => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            });
        }
    });

    Stub {
        base_url: format!("http://{addr}"),
        requests,
    }
}

fn ok(body: &'static str) -> Behaviour {
    Behaviour::Reply {
        status: "200 OK",
        body,
    }
}

const TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_registered_plate_is_authorized() {
    let server = stub(ok(r#"{"registered": true, "owner": "unit 4B"}"#)).await;
    let client = HttpRegistryClient::new(&server.base_url).unwrap();

    let result = client.lookup("ABC123", TIMEOUT).await;

    assert!(result.authorized);
    assert_eq!(result.plate, "ABC123");
    assert!(result.error.is_none());
    let requests = server.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("GET /check_plate?plate=ABC123 "));
}

#[tokio::test]
async fn test_unregistered_plate_is_denied_without_error() {
    let server = stub(ok(r#"{"registered": false}"#)).await;
    let client = HttpRegistryClient::new(format!("{}/", server.base_url)).unwrap();

    let result = client.lookup("XYZ789", TIMEOUT).await;

    assert!(!result.authorized);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_server_error_fails_closed() {
    let server = stub(Behaviour::Reply {
        status: "500 Internal Server Error",
        body: r#"{"registered": true}"#,
    })
    .await;
    let client = HttpRegistryClient::new(&server.base_url).unwrap();

    let result = client.lookup("ABC123", TIMEOUT).await;

    assert!(!result.authorized);
    assert!(result.error.unwrap().contains("500"));
}

#[tokio::test]
async fn test_malformed_body_fails_closed() {
    let server = stub(ok(r#"{"status": "ok"}"#)).await;
    let client = HttpRegistryClient::new(&server.base_url).unwrap();

    let result = client.lookup("ABC123", TIMEOUT).await;

    assert!(!result.authorized);
    assert!(result.error.unwrap().contains("malformed"));
}

#[tokio::test]
async fn test_silent_registry_times_out() {
    let server = stub(Behaviour::Hang).await;
    let client = HttpRegistryClient::new(&server.base_url).unwrap();

    let result = client.lookup("ABC123", Duration::from_millis(200)).await;

    assert!(!result.authorized);
    assert!(result.error.unwrap().contains("timed out"));
    assert!(result.latency_ms >= 200);
}

#[tokio::test]
async fn test_unreachable_registry_fails_closed() {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = HttpRegistryClient::new(format!("http://{addr}")).unwrap();

    let result = client.lookup("ABC123", TIMEOUT).await;

    assert!(!result.authorized);
    assert!(result.error.unwrap().contains("unreachable"));
}
