pub mod loader;
pub mod types;

pub use loader::{get_config_path, load_config, parse_config, CONFIG_ENV};
pub use types::{
    BackendType, DockerConfig, LocalConfig, RemoteConfig, RunboxConfig, SandboxConfig, API_KEY_ENV,
};
