//! The remote backend against the in-process envd stub.

use envd_stub::StubOptions;
use runbox::config::RemoteConfig;
use runbox::sandbox::RemoteSandbox;
use runbox::Sandbox;

const API_KEY: &str = "tck-key";

async fn remote_sandbox() -> Box<dyn Sandbox> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    // The server task keeps running after the handle is dropped.
    let stub = envd_stub::spawn(StubOptions {
        api_key: Some(API_KEY.to_string()),
        ..StubOptions::default()
    })
    .await
    .expect("envd stub");

    let config = RemoteConfig {
        api_key: Some(API_KEY.to_string()),
        api_url: stub.url(),
        envd_url: Some(stub.url()),
        work_dir: stub.root().to_string_lossy().into_owned(),
        ready_poll_interval_ms: 20,
        ready_timeout_ms: 5_000,
        ..RemoteConfig::default()
    };

    Box::new(RemoteSandbox::new(config).await.expect("remote sandbox"))
}

runbox::sandbox_tck!(remote_sandbox);
