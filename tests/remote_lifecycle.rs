use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use envd_stub::{StubOptions, StubServer};
use runbox::config::{BackendType, RemoteConfig, SandboxConfig};
use runbox::sandbox::backends::remote::{EnvdTransport, LifecycleClient, ProcessClient};
use runbox::sandbox::{AsAny, RemoteSandbox};
use runbox::{create_sandbox, ExecSpec, RunboxError, Sandbox};

const API_KEY: &str = "lifecycle-key";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn stub(options: StubOptions) -> StubServer {
    init_tracing();
    envd_stub::spawn(StubOptions {
        api_key: Some(API_KEY.to_string()),
        ..options
    })
    .await
    .expect("envd stub")
}

fn config_for(stub: &StubServer) -> RemoteConfig {
    RemoteConfig {
        api_key: Some(API_KEY.to_string()),
        api_url: stub.url(),
        envd_url: Some(stub.url()),
        work_dir: stub.root().to_string_lossy().into_owned(),
        ready_poll_interval_ms: 20,
        ready_timeout_ms: 5_000,
        ..RemoteConfig::default()
    }
}

#[tokio::test]
async fn test_builder_writes_initial_files_and_reconnect_sees_them() {
    let stub = stub(StubOptions::default()).await;
    let config = config_for(&stub);

    let sandbox = RemoteSandbox::builder(config.clone())
        .template("python")
        .timeout(Duration::from_secs(90))
        .env("PROJECT", "runbox")
        .with_file("src/main.py", "print('hi')\n")
        .build()
        .await
        .unwrap();

    let id = sandbox.sandbox_id().to_string();
    assert!(stub.is_live(&id));
    assert_eq!(stub.sandbox_timeout(&id), Some(90));
    assert_eq!(sandbox.handle().access_token.as_deref(), Some("stub-access-token"));

    let reconnected = RemoteSandbox::connect(config, &id).await.unwrap();
    assert_eq!(reconnected.sandbox_id(), id);
    assert_eq!(
        reconnected.files().unwrap().read("src/main.py").await.unwrap(),
        "print('hi')\n"
    );

    sandbox.close().await.unwrap();
    assert!(!stub.is_live(&id));

    // Already destroyed through the first handle; a 404 still counts as closed.
    reconnected.close().await.unwrap();
    assert!(reconnected.is_closed());
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let stub = stub(StubOptions::default()).await;
    let client = LifecycleClient::new(config_for(&stub)).unwrap();

    let handle = client
        .create("base", Duration::from_secs(60), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(handle.envd_url, stub.url());

    client.destroy(&handle.sandbox_id).await.unwrap();
    client.destroy(&handle.sandbox_id).await.unwrap();
    assert!(!stub.is_live(&handle.sandbox_id));
}

#[tokio::test]
async fn test_reconnect_unknown_sandbox_fails() {
    let stub = stub(StubOptions::default()).await;

    match RemoteSandbox::connect(config_for(&stub), "sbx-missing").await {
        Err(RunboxError::ReconnectFailed { id, status, .. }) => {
            assert_eq!(id, "sbx-missing");
            assert_eq!(status, Some(404));
        }
        Err(other) => panic!("expected ReconnectFailed, got {:?}", other),
        Ok(_) => panic!("expected ReconnectFailed, got a sandbox"),
    }
}

#[tokio::test]
async fn test_wrong_api_key_fails_creation() {
    let stub = stub(StubOptions::default()).await;
    let config = RemoteConfig {
        api_key: Some("wrong".to_string()),
        ..config_for(&stub)
    };

    match RemoteSandbox::new(config).await {
        Err(RunboxError::CreationFailed { status, body }) => {
            assert_eq!(status, Some(401));
            assert!(body.contains("invalid API key"));
        }
        Err(other) => panic!("expected CreationFailed, got {:?}", other),
        Ok(_) => panic!("expected CreationFailed, got a sandbox"),
    }
}

#[tokio::test]
async fn test_extend_timeout() {
    let stub = stub(StubOptions::default()).await;
    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();
    let id = sandbox.sandbox_id().to_string();

    sandbox.extend_timeout(Duration::from_secs(600)).await.unwrap();
    assert_eq!(stub.sandbox_timeout(&id), Some(600));

    sandbox.close().await.unwrap();
    assert!(matches!(
        sandbox.extend_timeout(Duration::from_secs(60)).await,
        Err(RunboxError::Closed)
    ));
}

#[tokio::test]
async fn test_readiness_waits_through_bad_gateway() {
    let stub = stub(StubOptions {
        unhealthy_polls: 3,
        ..StubOptions::default()
    })
    .await;

    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();
    assert!(stub.health_polls() >= 4);

    let result = sandbox.execute(&ExecSpec::argv(["echo", "ready"])).await.unwrap();
    assert_eq!(result.stdout, "ready\n");
    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_final_probe_runs_at_deadline() {
    let stub = stub(StubOptions {
        unhealthy_polls: 1,
        ..StubOptions::default()
    })
    .await;
    let config = RemoteConfig {
        ready_poll_interval_ms: 1_000,
        ready_timeout_ms: 800,
        ..config_for(&stub)
    };

    let started = Instant::now();
    let sandbox = RemoteSandbox::new(config).await.unwrap();
    assert_eq!(stub.health_polls(), 2);
    assert!(started.elapsed() >= Duration::from_millis(800));

    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_not_ready_within_deadline() {
    let stub = stub(StubOptions {
        unhealthy_polls: u32::MAX,
        ..StubOptions::default()
    })
    .await;
    let config = RemoteConfig {
        ready_timeout_ms: 200,
        ..config_for(&stub)
    };

    let started = Instant::now();
    match RemoteSandbox::new(config).await {
        Err(RunboxError::NotReady { url, waited }) => {
            assert_eq!(url, stub.url());
            assert_eq!(waited, Duration::from_millis(200));
        }
        Err(other) => panic!("expected NotReady, got {:?}", other),
        Ok(_) => panic!("expected NotReady, got a sandbox"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    // The sandbox that never became ready is torn down.
    assert!(!stub.is_live("sbx-1"));
}

#[tokio::test]
async fn test_timeout_carries_requested_duration() {
    let stub = stub(StubOptions::default()).await;
    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();

    let started = Instant::now();
    let spec = ExecSpec::argv(["sleep", "5"]).with_timeout(Duration::from_millis(500));
    match sandbox.execute(&spec).await {
        Err(RunboxError::Timeout { timeout }) => assert_eq!(timeout, Duration::from_millis(500)),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(4));

    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_trailer_error_surfaces_as_execution_failure() {
    let stub = stub(StubOptions {
        process_error: Some("process crashed".to_string()),
        ..StubOptions::default()
    })
    .await;
    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();

    match sandbox.execute(&ExecSpec::argv(["true"])).await {
        Err(RunboxError::ExecutionFailed { body, .. }) => {
            assert!(body.contains("process crashed"), "{}", body)
        }
        other => panic!("expected ExecutionFailed, got {:?}", other),
    }
    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_code_and_env_overlay() {
    let stub = stub(StubOptions::default()).await;
    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();

    let spec = ExecSpec::shell("echo \"$GREETING, $NAME\"; exit 7")
        .with_env("GREETING", "hello")
        .with_env("NAME", "it's me");
    let result = sandbox.execute(&spec).await.unwrap();

    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stdout, "hello, it's me\n");
    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_factory_builds_remote_sandbox() {
    let stub = stub(StubOptions::default()).await;
    let config = SandboxConfig {
        backend: BackendType::Remote,
        remote: config_for(&stub),
        ..SandboxConfig::default()
    };

    let sandbox = create_sandbox(&config).await.unwrap();
    let remote = sandbox
        .as_ref()
        .as_any()
        .downcast_ref::<RemoteSandbox>()
        .expect("remote sandbox");
    assert!(stub.is_live(remote.sandbox_id()));

    sandbox.close().await.unwrap();
    assert!(!stub.is_live(remote.sandbox_id()));
}

#[tokio::test]
async fn test_rejected_process_start_carries_status() {
    let stub = stub(StubOptions::default()).await;
    let transport =
        EnvdTransport::new(stub.url(), Some("wrong-token".to_string()), Duration::from_secs(5))
            .unwrap();
    let process = ProcessClient::new(transport);

    match process
        .run("echo hi", stub.root(), Duration::from_secs(10))
        .await
    {
        Err(RunboxError::ExecutionFailed { status, body }) => {
            assert_eq!(status, Some(401));
            assert!(body.contains("access token"), "{}", body);
        }
        other => panic!("expected ExecutionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remove_of_vanished_path_is_not_found() {
    let stub = stub(StubOptions {
        racing_remove: true,
        ..StubOptions::default()
    })
    .await;
    let sandbox = RemoteSandbox::new(config_for(&stub)).await.unwrap();
    let files = sandbox.files().unwrap();
    files.create("gone.txt", "x").await.unwrap();
    assert!(files.exists("gone.txt").await);

    let err = files.delete("gone.txt", false).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {:?}", err);
    assert!(!files.exists("gone.txt").await);

    sandbox.close().await.unwrap();
}
