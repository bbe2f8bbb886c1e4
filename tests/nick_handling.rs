//! Nickname repair: a juped nickname (437) is treated as a collision,
//! falling back to the nickname the server still considers ours.

mod common;

use common::server::BouncerConfig;
use common::{ScriptedUpstream, TestBouncer, TestClient};

#[tokio::test]
async fn test_437_jupe_falls_back_to_old_nick() {
    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20103,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: String::new(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "zoe")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("accept");
    conn.complete_registration("irc.test").await.expect("registration");
    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome");

    // The server announces the nickname is juped
    conn.send(":irc.test 437 zoe zoe :Nick/channel is temporarily unavailable")
        .await
        .expect("send 437");

    // Treated as a 433: the bouncer confirms the surviving nickname to
    // the client and lets the numeric through
    client
        .recv_until(|l| l.starts_with(":zoe") && l.contains(" NICK "))
        .await
        .expect("self-NICK repair");
    client
        .recv_until(|l| l.contains(" 437 "))
        .await
        .expect("numeric passed through");
}

#[tokio::test]
async fn test_detached_nick_collision_regenerates() {
    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20104,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: String::new(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "zoe")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("accept");
    conn.complete_registration("irc.test").await.expect("registration");
    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome");

    // Detach, then reject the nickname with no fallback: the bouncer has
    // to invent a replacement on its own
    drop(client);
    conn.recv_until(|l| l.starts_with("AWAY")).await.expect("detached");

    conn.send(":irc.test 433 * zoe :Nickname is already in use")
        .await
        .expect("send 433");
    let generated = conn
        .recv_until(|l| l.starts_with("NICK"))
        .await
        .expect("regenerated nick requested");
    assert!(
        generated.ends_with(":zoe-") || generated.ends_with(" zoe-"),
        "expected generated nick zoe-, got: {generated}"
    );
}
