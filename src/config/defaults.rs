//! Serde default functions for configuration values.
//!
//! These mirror the historical defaults of detachable IRC bouncers; change
//! the configuration file rather than these.

pub fn default_true() -> bool {
    true
}

pub fn default_listen_port() -> String {
    "57000".to_string()
}

pub fn default_client_timeout() -> u64 {
    60
}

pub fn default_connect_timeout() -> u64 {
    60
}

pub fn default_dns_timeout() -> u64 {
    20
}

pub fn default_server_port() -> u16 {
    6667
}

pub fn default_server_retry() -> u64 {
    15
}

/// 0 = iterate forever.
pub fn default_server_maxattempts() -> u32 {
    0
}

/// 0 = iterate forever, not recommended.
pub fn default_server_maxinitattempts() -> u32 {
    5
}

/// How long after a kick before we try to rejoin.  -1 = don't rejoin.
pub fn default_channel_rejoin() -> i64 {
    15
}

pub fn default_initial_modes() -> Option<String> {
    Some("i".to_string())
}

pub fn default_drop_modes() -> Option<String> {
    Some("oOws".to_string())
}

pub fn default_away_message() -> Option<String> {
    Some("Not available, messages are logged".to_string())
}

pub fn default_log_events() -> String {
    "all".to_string()
}

pub fn default_chan_log_recall() -> i64 {
    128
}

/// -1 = recall everything.
pub fn default_log_recall_all() -> i64 {
    -1
}

pub fn default_dcc_proxy_timeout() -> u64 {
    60
}

/// GET allowed, SET denied.
pub fn default_allow_dynamic() -> u8 {
    1
}
