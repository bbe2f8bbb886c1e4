//! Server cycling: when the initial connection attempts are exhausted the
//! session is killed with an ERROR, and servers beyond the budget are
//! never tried.

mod common;

use std::time::Duration;

use common::server::BouncerConfig;
use common::{ScriptedUpstream, TestBouncer, TestClient};
use tokio::net::TcpListener;

/// Bind and immediately release a port, leaving it closed.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_initial_attempts_exhausted() {
    let a = dead_port().await;
    let b = dead_port().await;
    let c = ScriptedUpstream::bind().await.expect("bind C");

    let bouncer = TestBouncer::spawn(
        20102,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![
                format!("127.0.0.1:{}", a),
                format!("127.0.0.1:{}", b),
                c.address(),
            ],
            extra: "server_maxinitattempts = 2".to_owned(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    // A fails at once, B fails after one retry period, and that exhausts
    // the initial budget
    let error = client
        .recv_until(|l| l.starts_with("ERROR"))
        .await
        .expect("session killed");
    assert!(
        error.contains("Maximum initial connection attempts exceeded"),
        "unexpected error line: {error}"
    );

    // C was never tried
    c.assert_no_connection(Duration::from_millis(500)).await;
}
