//! Test IRC client.
//!
//! Connects to the bouncer, registers with PASS/NICK/USER, and asserts on
//! the lines it receives.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A test IRC client.
pub struct TestClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    nick: String,
}

impl TestClient {
    /// Connect to the bouncer.
    pub async fn connect(address: &str, nick: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read, write) = stream.into_split();
        Ok(TestClient {
            reader: BufReader::new(read).lines(),
            writer: write,
            nick: nick.to_owned(),
        })
    }

    /// Send a raw IRC line.
    pub async fn send_raw(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Register against the bouncer with a password.
    pub async fn register(&mut self, password: &str) -> anyhow::Result<()> {
        self.send_raw(&format!("PASS {}", password)).await?;
        let nick = self.nick.clone();
        self.send_raw(&format!("NICK {}", nick)).await?;
        self.send_raw(&format!("USER {} 0 * :Test User", nick)).await?;
        Ok(())
    }

    /// Receive a single line.
    pub async fn recv(&mut self) -> anyhow::Result<String> {
        self.recv_timeout(Duration::from_secs(15)).await
    }

    /// Receive a line with a custom timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<String> {
        let line = timeout(dur, self.reader.next_line())
            .await??
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
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

    /// Assert that no line matching the predicate arrives within `dur`.
    pub async fn assert_silent<F>(&mut self, dur: Duration, mut predicate: F) -> anyhow::Result<()>
    where
        F: FnMut(&str) -> bool,
    {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match timeout(remaining, self.reader.next_line()).await {
                Err(_) => return Ok(()),
                Ok(Ok(Some(line))) => {
                    if predicate(line.trim_end()) {
                        anyhow::bail!("unexpected line: {}", line.trim_end());
                    }
                }
                Ok(Ok(None)) | Ok(Err(_)) => anyhow::bail!("connection closed"),
            }
        }
    }
}
