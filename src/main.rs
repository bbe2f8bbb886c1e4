//! slbncd - Straylight IRC Bouncer
//!
//! A detachable IRC proxy: clients connect here instead of to the IRC
//! server, and the bouncer holds the server connection open (logging
//! traffic, guarding the nickname, answering CTCPs) while the client is
//! away.

mod config;
mod dcc;
mod error;
mod listener;
mod logs;
mod registry;
mod resolver;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::registry::{Globals, Registry};
use crate::resolver::Resolver;

/// Name used on the wire: notice prefixes, log sources, version strings.
pub const PACKAGE: &str = "slbncd";
/// Daemon version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seconds to let sessions flush their sockets during shutdown.
const NET_LINGER_TIME: u64 = 5;

/// Per-user configuration file, tried first.
const USER_CONFIG_FILENAME: &str = ".slbncdrc.toml";
/// System-wide configuration file.
const GLOBAL_CONFIG_PATH: &str = "/etc/slbncd/slbncd.toml";

struct Options {
    config_path: Option<PathBuf>,
    listen_port: Option<String>,
    pid_file: Option<String>,
    background: bool,
    inetd: bool,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [-hvDI] [-f config_file] [-P listen_port] [-p pid_file]"
    )
}

fn parse_args() -> Result<Options, Error> {
    let program = std::env::args().next().unwrap_or_else(|| PACKAGE.to_owned());
    let mut options = Options {
        config_path: None,
        listen_port: None,
        pid_file: None,
        background: false,
        inetd: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-f" => {
                let path = args
                    .next()
                    .ok_or_else(|| Error::Usage(usage(&program)))?;
                options.config_path = Some(PathBuf::from(path));
            }
            "-P" => {
                let port = args
                    .next()
                    .ok_or_else(|| Error::Usage(usage(&program)))?;
                options.listen_port = Some(port);
            }
            "-p" => {
                let path = args
                    .next()
                    .ok_or_else(|| Error::Usage(usage(&program)))?;
                options.pid_file = Some(path);
            }
            "-D" => options.background = !options.background,
            "-I" => {
                options.inetd = true;
                options.background = true;
            }
            "-h" => {
                println!("{}", usage(&program));
                std::process::exit(0);
            }
            "-v" => {
                println!("{} {}", PACKAGE, VERSION);
                std::process::exit(0);
            }
            _ => return Err(Error::Usage(usage(&program))),
        }
    }
    Ok(options)
}

/// Pick the configuration file: an explicit `-f`, the user's own file
/// (which must not be group/world accessible), or the system-wide one.
fn resolve_config_path(options: &Options) -> Result<PathBuf, Error> {
    if let Some(ref path) = options.config_path {
        return Ok(path.clone());
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_path = PathBuf::from(home).join(USER_CONFIG_FILENAME);
        if let Ok(meta) = std::fs::metadata(&user_path) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o077 != 0 {
                    return Err(Error::Config(format!(
                        "{} must not be group or world accessible",
                        user_path.display()
                    )));
                }
            }
            let _ = meta;
            return Ok(user_path);
        }
    }

    Ok(PathBuf::from(GLOBAL_CONFIG_PATH))
}

fn write_pid_file(path: &str) {
    if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
        warn!(path, error = %e, "Couldn't write pid file");
    }
}

#[tokio::main]
async fn main() {
    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    let config_path = match resolve_config_path(&options) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}: {}", PACKAGE, e);
            std::process::exit(e.exit_code());
        }
    };

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", PACKAGE, e);
            std::process::exit(e.exit_code());
        }
    };
    if let Some(port) = options.listen_port.clone() {
        config.listen_port = port;
    }
    if let Some(pid) = options.pid_file.clone() {
        config.pid_file = Some(pid);
    }

    // In background mode console output is limited to real problems; the
    // init system owns the process, so there is no daemonize step.
    let default_filter = if options.background { "error" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    match config.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    info!(
        version = VERSION,
        config = %config_path.display(),
        classes = config.connections.len(),
        "Starting slbncd"
    );

    let classes: Vec<Arc<config::ConnectionClass>> =
        config.connections.iter().cloned().map(Arc::new).collect();
    let resolver = Resolver::new(config.dns_timeout);
    let registry = Arc::new(Registry::new(
        classes,
        Globals {
            client_timeout: config.client_timeout,
            connect_timeout: config.connect_timeout,
            listen_port: None,
        },
        resolver,
    ));

    if let Some(ref path) = config.pid_file {
        write_pid_file(path);
    }
    let pid_file = config.pid_file.clone();

    // Listener (or the single inherited client, in inetd mode)
    let mut inetd_done = None;
    if options.inetd {
        info!("Running in inetd mode");
        let registry = Arc::clone(&registry);
        inetd_done = Some(tokio::spawn(async move {
            listener::run_inetd(registry).await;
        }));
    } else {
        let bouncer_listener =
            match listener::Listener::bind(&config.listen_port, Arc::clone(&registry)).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(error = %e, "Cannot listen for clients");
                    if let Some(ref path) = pid_file {
                        let _ = std::fs::remove_file(path);
                    }
                    std::process::exit(Error::Listen(e).exit_code());
                }
            };
        registry.set_listen_port(bouncer_listener.port());
        tokio::spawn(bouncer_listener.run());
    }

    // Signals: TERM/INT stop, HUP reloads.  The admin surface can request
    // both through the registry.
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to install SIGHUP handler");

    let mut shutdown_rx = registry.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT - shutting down");
                registry.shutdown();
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM - shutting down");
                registry.shutdown();
                break;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested");
                break;
            }
            _ = sighup.recv() => {
                reload(&config_path, &registry).await;
            }
            _ = registry.reload_requested() => {
                reload(&config_path, &registry).await;
            }
            _ = wait_for(&mut inetd_done) => {
                info!("Inherited client finished");
                registry.shutdown();
                break;
            }
        }
    }

    // Give sessions a moment to flush and say goodbye
    let deadline = tokio::time::Instant::now() + Duration::from_secs(NET_LINGER_TIME);
    while registry.session_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if let Some(ref path) = pid_file {
        let _ = std::fs::remove_file(path);
    }
    info!("Goodbye");
}

/// Wait for the inetd client task, or forever when there is none.
async fn wait_for(task: &mut Option<tokio::task::JoinHandle<()>>) {
    match task {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}

/// Reload the configuration.  A bad file is rejected and the previous
/// configuration stays in force.
async fn reload(config_path: &std::path::Path, registry: &Arc<Registry>) {
    info!(config = %config_path.display(), "Reloading configuration");
    match Config::load(config_path) {
        Ok(config) => {
            let classes: Vec<Arc<config::ConnectionClass>> =
                config.connections.iter().cloned().map(Arc::new).collect();
            let globals = Globals {
                client_timeout: config.client_timeout,
                connect_timeout: config.connect_timeout,
                listen_port: registry.globals().listen_port,
            };
            registry.apply_reload(classes, globals).await;
            info!("Configuration reloaded");
        }
        Err(e) => {
            error!(error = %e, "Reload failed, retaining previous configuration");
        }
    }
}
