//! Connection classes and the live-session registry.
//!
//! The registry is the only process-wide mutable state: the ordered list
//! of connection classes from the configuration file, and one handle per
//! live session.  Sessions own everything else.  On reload the class list
//! is swapped atomically and live sessions are rebound to the class whose
//! password matches byte-for-byte; sessions whose password vanished are
//! terminated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info};

use crate::config::ConnectionClass;
use crate::resolver::Resolver;
use crate::session::Control;
use slbnc_proto::irc_wildmatch;

/// Values shared by every session, refreshed on reload.
#[derive(Debug, Clone)]
pub struct Globals {
    /// Seconds a client may take to log in.
    pub client_timeout: u64,
    /// Seconds a client may take to pick a server.
    pub connect_timeout: u64,
    /// Port clients reconnect to, `None` when running from inetd.
    pub listen_port: Option<u16>,
}

/// A snapshot of session state kept current for registry consumers
/// (USERS listings, eviction policy, KILL/NOTIFY target lookup).
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    /// Live nickname.
    pub nickname: Option<String>,
    /// Reverse-resolved client host.
    pub client_host: Option<String>,
    /// Upstream server currently connected to.
    pub server_name: Option<String>,
    /// Whether a client is currently attached.
    pub client_connected: bool,
}

/// Handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    /// Control channel into the session's event loop.
    pub control: mpsc::Sender<Control>,
    /// Shared state snapshot.
    pub info: Arc<Mutex<SessionInfo>>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionHandle {
    /// Create a handle and the receiving end of its control channel.
    pub fn new() -> (SessionHandle, mpsc::Receiver<Control>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = SessionHandle {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            control: tx,
            info: Arc::new(Mutex::new(SessionInfo::default())),
        };
        (handle, rx)
    }

    /// Whether two handles refer to the same session.
    pub fn is(&self, other: &SessionHandle) -> bool {
        self.id == other.id
    }
}

/// Outcome of routing a freshly authenticated client to its class.
pub enum Route {
    /// A session already holds this class; attach through its handle.
    Existing(SessionHandle),
    /// No session existed; one was registered and must now be launched
    /// with this handle and control receiver.
    Created(SessionHandle, mpsc::Receiver<Control>),
}

/// The opaque password predicate: bcrypt for `$2*$` hashes, constant-time
/// equality for anything else.
pub fn verify_password(candidate: &str, stored: &str) -> bool {
    if stored.starts_with("$2") {
        bcrypt::verify(candidate, stored).unwrap_or(false)
    } else {
        candidate.as_bytes().ct_eq(stored.as_bytes()).into()
    }
}

/// Process-wide shared state.
pub struct Registry {
    classes: RwLock<Vec<Arc<ConnectionClass>>>,
    sessions: DashMap<String, SessionHandle>,
    globals: RwLock<Globals>,
    /// Shared DNS adapter.
    pub resolver: Resolver,
    shutdown_tx: broadcast::Sender<()>,
    reload_requested: Notify,
}

impl Registry {
    /// Build the registry from loaded configuration.
    pub fn new(
        classes: Vec<Arc<ConnectionClass>>,
        globals: Globals,
        resolver: Resolver,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Registry {
            classes: RwLock::new(classes),
            sessions: DashMap::new(),
            globals: RwLock::new(globals),
            resolver,
            shutdown_tx,
            reload_requested: Notify::new(),
        }
    }

    /// Current globals snapshot.
    pub fn globals(&self) -> Globals {
        self.globals.read().clone()
    }

    /// Record the port the client listener bound (None in inetd mode).
    pub fn set_listen_port(&self, port: Option<u16>) {
        self.globals.write().listen_port = port;
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Find the first class accepting this password and origin.
    /// Classes with `from` masks require the client's address or resolved
    /// hostname to match at least one pattern.
    pub fn authenticate(
        &self,
        password: &str,
        ip: &str,
        host: &str,
    ) -> Option<Arc<ConnectionClass>> {
        for class in self.classes.read().iter() {
            if !verify_password(password, &class.password) {
                continue;
            }
            if class.from_masks.is_empty()
                || class
                    .from_masks
                    .iter()
                    .any(|m| irc_wildmatch(ip, m) || irc_wildmatch(host, m))
            {
                return Some(Arc::clone(class));
            }
        }
        None
    }

    /// The live session for a class, when one exists.
    pub fn session_for(&self, class: &ConnectionClass) -> Option<SessionHandle> {
        self.sessions.get(&class.password).map(|h| h.clone())
    }

    /// Atomically look up or register the session for a class, so that
    /// two clients authenticating at once cannot create two sessions.
    pub fn route(&self, class: &ConnectionClass) -> Route {
        match self.sessions.entry(class.password.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Route::Existing(occupied.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (handle, rx) = SessionHandle::new();
                vacant.insert(handle.clone());
                Route::Created(handle, rx)
            }
        }
    }

    /// Register a session for a class.
    pub fn insert_session(&self, class: &ConnectionClass, handle: SessionHandle) {
        self.sessions.insert(class.password.clone(), handle);
    }

    /// Remove a session, but only the one `handle` refers to.
    pub fn remove_session(&self, class_password: &str, handle: &SessionHandle) {
        self.sessions
            .remove_if(class_password, |_, existing| existing.id == handle.id);
    }

    /// Live sessions in configuration order, for USERS listings and
    /// KILL/NOTIFY target lookup.
    pub fn live_sessions(&self) -> Vec<(Arc<ConnectionClass>, SessionHandle)> {
        self.classes
            .read()
            .iter()
            .filter_map(|class| {
                self.session_for(class).map(|h| (Arc::clone(class), h))
            })
            .collect()
    }

    /// Find a session by 1-based index, client host, server name or
    /// nickname.
    pub fn find_session(&self, needle: &str) -> Option<(Arc<ConnectionClass>, SessionHandle)> {
        let index: Option<usize> = needle.parse().ok();
        for (i, (class, handle)) in self.live_sessions().into_iter().enumerate() {
            let info = handle.info.lock().clone();
            let matches = index == Some(i + 1)
                || info
                    .client_host
                    .as_deref()
                    .is_some_and(|h| irc_wildmatch(h, needle) || h.eq_ignore_ascii_case(needle))
                || info
                    .server_name
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(needle))
                || info
                    .nickname
                    .as_deref()
                    .is_some_and(|n| slbnc_proto::irc_eq(n, needle));
            if matches {
                return Some((class, handle));
            }
        }
        None
    }

    /// Swap in a reloaded class list.  Live sessions are rebound to the
    /// class with the byte-identical password or terminated.
    pub async fn apply_reload(&self, new_classes: Vec<Arc<ConnectionClass>>, globals: Globals) {
        let previous: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        *self.classes.write() = new_classes.clone();
        *self.globals.write() = globals;

        for (password, handle) in previous {
            match new_classes.iter().find(|c| c.password == password) {
                Some(class) => {
                    debug!("Rebinding session to reloaded class");
                    let _ = handle.control.send(Control::Rebind(Arc::clone(class))).await;
                }
                None => {
                    info!("Session's class removed by reload, terminating");
                    let _ = handle
                        .control
                        .send(Control::Terminate("Class removed from configuration".into()))
                        .await;
                }
            }
        }
    }

    /// Ask the front-end to reload the configuration file.
    pub fn request_reload(&self) {
        self.reload_requested.notify_one();
    }

    /// Wait for a reload request from the admin surface.
    pub async fn reload_requested(&self) {
        self.reload_requested.notified().await;
    }

    /// Begin daemon shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(password: &str, masks: &[&str]) -> Arc<ConnectionClass> {
        let toml = format!(
            "password = \"{}\"\nserver = [\"irc.example.org\"]\nfrom = [{}]",
            password,
            masks
                .iter()
                .map(|m| format!("\"{m}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Arc::new(toml::from_str(&toml).expect("class toml"))
    }

    fn registry(classes: Vec<Arc<ConnectionClass>>) -> Registry {
        Registry::new(
            classes,
            Globals {
                client_timeout: 60,
                connect_timeout: 60,
                listen_port: Some(57000),
            },
            Resolver::new(1),
        )
    }

    #[tokio::test]
    async fn test_authenticate_first_match_wins() {
        let reg = registry(vec![class("alpha", &[]), class("alpha", &["*.example.com"])]);
        let found = reg.authenticate("alpha", "10.0.0.1", "x.example.com").unwrap();
        assert!(found.from_masks.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_mask_required() {
        let reg = registry(vec![class("beta", &["*.example.com"])]);
        assert!(reg.authenticate("beta", "10.0.0.1", "h.example.com").is_some());
        assert!(reg.authenticate("beta", "10.0.0.1", "h.example.org").is_none());
        assert!(reg.authenticate("wrong", "10.0.0.1", "h.example.com").is_none());
    }

    #[test]
    fn test_verify_password_plain() {
        assert!(verify_password("secret", "secret"));
        assert!(!verify_password("secrex", "secret"));
        assert!(!verify_password("secret2", "secret"));
    }

    #[test]
    fn test_verify_password_bcrypt() {
        let hash = bcrypt::hash("letmein", 4).unwrap();
        assert!(verify_password("letmein", &hash));
        assert!(!verify_password("letmeout", &hash));
    }

    #[tokio::test]
    async fn test_session_identity_removal() {
        let reg = registry(vec![class("gamma", &[])]);
        let classes = reg.classes.read().clone();
        let (h1, _rx1) = SessionHandle::new();
        reg.insert_session(&classes[0], h1.clone());

        let (h2, _rx2) = SessionHandle::new();
        // Removing with a stale handle must not unregister the new session
        reg.insert_session(&classes[0], h2.clone());
        reg.remove_session(&classes[0].password, &h1);
        assert!(reg.session_for(&classes[0]).is_some());
        reg.remove_session(&classes[0].password, &h2);
        assert!(reg.session_for(&classes[0]).is_none());
    }
}
