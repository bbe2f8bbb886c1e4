//! Scripted upstream IRC server.
//!
//! Plays the part of the IRC network the bouncer connects to: accepts one
//! connection, answers the registration burst, and then follows whatever
//! script the test drives it with.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// The scripted upstream listener.
pub struct ScriptedUpstream {
    listener: TcpListener,
    port: u16,
}

/// One accepted bouncer connection.
pub struct UpstreamConn {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ScriptedUpstream {
    /// Bind on an ephemeral local port.
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(ScriptedUpstream { listener, port })
    }

    /// The port to put in the bouncer's server list.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` for the bouncer's server list.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Wait for the bouncer to connect.
    pub async fn accept(&self) -> anyhow::Result<UpstreamConn> {
        let (stream, _) = timeout(Duration::from_secs(15), self.listener.accept()).await??;
        let (read, write) = stream.into_split();
        Ok(UpstreamConn {
            reader: BufReader::new(read).lines(),
            writer: write,
        })
    }

    /// Check that nothing connected (used to prove a server was skipped).
    pub async fn assert_no_connection(&self, wait: Duration) {
        let result = timeout(wait, self.listener.accept()).await;
        assert!(result.is_err(), "unexpected connection to this server");
    }
}

impl UpstreamConn {
    /// Send a raw line.
    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one line (CR/LF stripped).
    pub async fn recv(&mut self) -> anyhow::Result<String> {
        let line = timeout(Duration::from_secs(15), self.reader.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("upstream connection closed"))?;
        Ok(line.trim_end().to_owned())
    }

    /// Read lines until one satisfies the predicate, returning it.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<String>
    where
        F: FnMut(&str) -> bool,
    {
        loop {
            let line = self.recv().await?;
            if predicate(&line) {
                return Ok(line);
            }
        }
    }

    /// Answer the bouncer's NICK/USER registration with a welcome burst
    /// and return the nickname it registered.
    pub async fn complete_registration(&mut self, server_name: &str) -> anyhow::Result<String> {
        let nick_line = self.recv_until(|l| l.starts_with("NICK")).await?;
        let nick = nick_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("")
            .trim_start_matches(':')
            .to_owned();
        self.recv_until(|l| l.starts_with("USER")).await?;

        self.send(&format!(
            ":{} 001 {} :Welcome to the Test IRC Network {}",
            server_name, nick, nick
        ))
        .await?;
        self.send(&format!(
            ":{} 004 {} {} testd-1.0 aoOirw biklmnopstv",
            server_name, nick, server_name
        ))
        .await?;
        Ok(nick)
    }
}
