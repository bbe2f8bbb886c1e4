//! Detach and reattach: the upstream connection survives a client
//! disconnect, and the channel plus its logged traffic come back on
//! reattach.

mod common;

use std::time::Duration;

use common::{ScriptedUpstream, TestBouncer, TestClient};
use common::server::BouncerConfig;

#[tokio::test]
async fn test_detach_reattach_preserves_channel() {
    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20101,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: String::new(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("bouncer dialed upstream");
    let nick = conn
        .complete_registration("irc.test")
        .await
        .expect("registration");
    assert_eq!(nick, "alice");

    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome reached client");

    // Join a channel through the bouncer
    client.send_raw("JOIN #x").await.expect("send join");
    conn.recv_until(|l| l.starts_with("JOIN"))
        .await
        .expect("join forwarded upstream");
    conn.send(":alice!alice@client.test JOIN :#x")
        .await
        .expect("echo join");

    // The bouncer asks for the modes on our behalf; the reply must not
    // reach the client
    conn.recv_until(|l| l.starts_with("MODE #x") || l.starts_with("MODE :#x"))
        .await
        .expect("mode request");
    conn.send(":irc.test 324 alice #x +nt").await.expect("send 324");

    client
        .recv_until(|l| l.contains("JOIN") && l.contains("#x"))
        .await
        .expect("join reached client");
    client
        .assert_silent(Duration::from_millis(500), |l| l.contains(" 324 "))
        .await
        .expect("mode reply squelched");

    conn.send(":bob!bob@host PRIVMSG #x :hello there")
        .await
        .expect("channel text");
    client
        .recv_until(|l| l.contains("hello there"))
        .await
        .expect("channel text reached client");

    // Detach: just drop the socket
    drop(client);
    conn.recv_until(|l| l.starts_with("AWAY"))
        .await
        .expect("away set on detach");

    // Traffic while detached is logged
    conn.send(":bob!bob@host PRIVMSG #x :missed this")
        .await
        .expect("detached channel text");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Reattach with the same credentials
    let mut client2 = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("reconnect client");
    client2.register("foo").await.expect("re-register");

    client2
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome replayed");
    client2
        .recv_until(|l| l.contains("JOIN") && l.contains("#x"))
        .await
        .expect("synthetic self-join");
    client2
        .recv_until(|l| l.contains("missed this"))
        .await
        .expect("channel recall");

    // The upstream connection was never dropped or re-dialed
    upstream
        .assert_no_connection(Duration::from_millis(300))
        .await;
}
