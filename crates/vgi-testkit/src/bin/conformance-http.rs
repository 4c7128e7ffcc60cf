//! Conformance worker: serves the conformance protocol over HTTP.
//!
//! Binds an ephemeral port and announces it as `PORT:<n>` on stdout.
//! `VGI_COMPRESSION_LEVEL` turns on zstd response compression.

use std::io::Write;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use vgi_http::{HttpServerConfig, HttpService};
use vgi_testkit::conformance_protocol;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = HttpServerConfig::default();
    if let Ok(raw) = std::env::var("VGI_COMPRESSION_LEVEL") {
        match raw.parse() {
            Ok(level) => config = config.with_compression_level(level),
            Err(_) => tracing::warn!(raw = %raw, "ignoring unparseable VGI_COMPRESSION_LEVEL"),
        }
    }

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    println!("PORT:{port}");
    let _ = std::io::stdout().flush();

    let service = HttpService::new(Arc::new(conformance_protocol()), config);
    if let Err(e) = service.serve(listener).await {
        tracing::error!(error = %e, "http worker failed");
        std::process::exit(1);
    }
}
