//! Integration test common infrastructure.
//!
//! Provides utilities for spawning a bouncer instance against a generated
//! configuration, a scripted upstream IRC server, and a test client.

pub mod client;
pub mod server;
pub mod upstream;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use server::TestBouncer;
#[allow(unused_imports)]
pub use upstream::ScriptedUpstream;
