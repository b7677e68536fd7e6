pub mod config;
pub mod error;
pub mod sandbox;
pub mod tck;

pub use error::{Result, RunboxError};
pub use sandbox::{
    create_sandbox, ExecResult, ExecSpec, FileEntry, FileSpec, FileType, Sandbox, SandboxFiles,
};
