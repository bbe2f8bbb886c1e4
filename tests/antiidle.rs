//! Anti-idle probes and the suppression of their 411 replies.

mod common;

use std::time::Duration;

use common::server::BouncerConfig;
use common::{ScriptedUpstream, TestBouncer, TestClient};

#[tokio::test]
async fn test_antiidle_411_suppressed() {
    let upstream = ScriptedUpstream::bind().await.expect("bind upstream");
    let bouncer = TestBouncer::spawn(
        20105,
        BouncerConfig {
            password: "foo".to_owned(),
            servers: vec![upstream.address()],
            extra: "idle_maxtime = 2".to_owned(),
        },
    )
    .await
    .expect("spawn bouncer");

    let mut client = TestClient::connect(&bouncer.address(), "alice")
        .await
        .expect("connect client");
    client.register("foo").await.expect("register");

    let mut conn = upstream.accept().await.expect("accept");
    conn.complete_registration("irc.test").await.expect("registration");
    client
        .recv_until(|l| l.contains(" 001 "))
        .await
        .expect("welcome");

    // After the idle period the bouncer probes with an empty PRIVMSG
    conn.recv_until(|l| l.trim() == "PRIVMSG")
        .await
        .expect("anti-idle probe");

    // The server's complaint about it must not reach the client
    conn.send(":irc.test 411 alice :No recipient given (PRIVMSG)")
        .await
        .expect("send 411");
    client
        .assert_silent(Duration::from_millis(800), |l| l.contains(" 411 "))
        .await
        .expect("411 squelched");

    // A 411 caused by real client activity is forwarded
    client.send_raw("PRIVMSG bob :hi").await.expect("real message");
    conn.recv_until(|l| l.starts_with("PRIVMSG bob"))
        .await
        .expect("message forwarded");
    conn.send(":irc.test 411 alice :No recipient given")
        .await
        .expect("send second 411");
    client
        .recv_until(|l| l.contains(" 411 "))
        .await
        .expect("genuine 411 forwarded");
}
