//! Conformance worker: serves the conformance protocol over stdio.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use vgi_pipe::{serve_stdio, PipeServerConfig};
use vgi_testkit::conformance_protocol;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let protocol = Arc::new(conformance_protocol());
    if let Err(e) = serve_stdio(protocol, PipeServerConfig::default()).await {
        tracing::error!(error = %e, "pipe worker failed");
        std::process::exit(1);
    }
}
