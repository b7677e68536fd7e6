use runbox::sandbox::LocalSandbox;
use runbox::Sandbox;

async fn local_sandbox() -> Box<dyn Sandbox> {
    Box::new(LocalSandbox::temp().expect("temporary local sandbox"))
}

runbox::sandbox_tck!(local_sandbox);
