mod docker;
mod local;
pub mod remote;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;
pub use remote::{RemoteSandbox, RemoteSandboxBuilder};
