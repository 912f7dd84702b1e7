//! Backend kinds and construction
//!
//! Maps a host's configured `kind` string to a backend instance. New
//! backends register here and in the config validator.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::backend::batch::BatchBackend;
use crate::backend::container::ContainerBackend;
use crate::backend::local::LocalBackend;
use crate::backend::traits::QueueBackend;
use crate::config::HostConfig;
use crate::error::{Error, Result};

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    Container,
    Batch,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Container => "container",
            BackendKind::Batch => "batch",
        }
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::Local, BackendKind::Container, BackendKind::Batch]
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "container" | "docker" => Ok(BackendKind::Container),
            "batch" | "pbs" | "spooler" => Ok(BackendKind::Batch),
            other => Err(Error::config_field_invalid(
                "kind",
                format!("unknown backend kind '{other}'"),
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the backend instance for one configured host
pub fn create_backend(config: &HostConfig, host_root: &Path) -> Result<Arc<dyn QueueBackend>> {
    let kind: BackendKind = config.kind.parse()?;
    debug!(kind = %kind, root = %host_root.display(), "Creating backend");
    let backend: Arc<dyn QueueBackend> = match kind {
        BackendKind::Local => Arc::new(LocalBackend::new()),
        BackendKind::Container => Arc::new(ContainerBackend::new(
            config.container.clone(),
            host_root.to_path_buf(),
        )),
        BackendKind::Batch => Arc::new(BatchBackend::new(config.batch.clone())),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("PBS".parse::<BackendKind>().unwrap(), BackendKind::Batch);
        assert_eq!(
            "docker".parse::<BackendKind>().unwrap(),
            BackendKind::Container
        );
        assert!("slurm-on-mars".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_create_backend_for_each_kind() {
        let root = Path::new("/tmp");
        for kind in BackendKind::all() {
            let config = HostConfig {
                kind: kind.as_str().to_string(),
                ..HostConfig::default()
            };
            let backend = create_backend(&config, root).unwrap();
            assert_eq!(backend.name(), kind.as_str());
        }
    }
}
