//! Test bouncer management.
//!
//! Spawns and manages slbncd instances for integration testing.

#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

/// A running bouncer instance.
pub struct TestBouncer {
    child: Child,
    port: u16,
    data_dir: PathBuf,
}

/// Extra configuration appended inside the test's `[[connection]]` block.
pub struct BouncerConfig {
    /// Client password.
    pub password: String,
    /// Upstream servers, `host:port` each.
    pub servers: Vec<String>,
    /// Additional class keys, raw TOML lines.
    pub extra: String,
}

impl TestBouncer {
    /// Spawn a bouncer listening on `port` with one connection class.
    pub async fn spawn(port: u16, config: BouncerConfig) -> anyhow::Result<Self> {
        let data_dir = std::env::temp_dir().join(format!("slbncd-test-{}", port));
        std::fs::create_dir_all(&data_dir)?;

        let servers = config
            .servers
            .iter()
            .map(|s| format!("\"{}\"", s))
            .collect::<Vec<_>>()
            .join(", ");

        let config_path = data_dir.join("slbncd.toml");
        let config_content = format!(
            r#"
listen_port = {port}
client_timeout = 10
connect_timeout = 10
dns_timeout = 2

[[connection]]
password = "{password}"
server = [{servers}]
server_retry = 1
server_pingtimeout = 0
{extra}
"#,
            port = port,
            password = config.password,
            servers = servers,
            extra = config.extra,
        );
        std::fs::write(&config_path, config_content)?;

        let cargo_manifest_dir = env!("CARGO_MANIFEST_DIR");
        let binary_path = PathBuf::from(cargo_manifest_dir).join("target/debug/slbncd");

        let child = Command::new(&binary_path)
            .arg("-f")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let bouncer = TestBouncer {
            child,
            port,
            data_dir,
        };
        bouncer.wait_until_listening().await?;
        Ok(bouncer)
    }

    /// The address clients connect to.
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn wait_until_listening(&self) -> anyhow::Result<()> {
        for _ in 0..100 {
            if TcpStream::connect(self.address()).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("bouncer did not start listening on {}", self.address());
    }
}

impl Drop for TestBouncer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}
