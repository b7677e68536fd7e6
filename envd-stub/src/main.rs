//! Standalone envd stub, for pointing the remote backend at a local directory.
//!
//! Environment:
//! - `ENVD_STUB_ADDR`: listen address (default `127.0.0.1:49983`)
//! - `ENVD_STUB_ROOT`: backing directory (default: a temporary directory)
//! - `ENVD_STUB_API_KEY`: require this API key on lifecycle calls

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use envd_stub::StubOptions;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr: SocketAddr = std::env::var("ENVD_STUB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:49983".to_string())
        .parse()
        .context("ENVD_STUB_ADDR is not a socket address")?;

    let options = StubOptions {
        addr,
        root: std::env::var_os("ENVD_STUB_ROOT").map(PathBuf::from),
        api_key: std::env::var("ENVD_STUB_API_KEY").ok(),
        ..StubOptions::default()
    };

    let server = envd_stub::spawn(options).await?;
    eprintln!("envd stub serving {} on {}", server.root().display(), server.url());
    server.wait().await
}
