//! Shared integration test infrastructure.

#![allow(dead_code)]

pub mod assertions;
pub mod harness;
pub mod server;
pub mod uploads;

pub use assertions::Assertions;
pub use harness::{LinkHarness, TestError, TestResult};
pub use server::TestCloudServer;
pub use uploads::RecordingUploads;

/// A localhost port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}
