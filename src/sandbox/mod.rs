pub mod backends;
mod factory;
pub mod paths;
pub mod shell;
mod traits;
mod types;

pub use backends::{DockerSandbox, LocalSandbox, RemoteSandbox, RemoteSandboxBuilder};
pub use factory::{available_backends, create_sandbox, BackendInfo};
pub use traits::{AsAny, Sandbox, SandboxFiles};
pub use types::{ExecCommand, ExecResult, ExecSpec, FileEntry, FileSpec, FileType};
