use std::path::PathBuf;

use forgehost_plugin_proto::Capability;
use thiserror::Error;

use crate::manager::PluginId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("plugin `{id}` not found")]
    NotFound { id: PluginId },

    #[error("failed to spawn `{path}`: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {details}")]
    Handshake { details: String },

    #[error("rpc failed during {operation}: {details}")]
    Rpc {
        operation: &'static str,
        details: String,
    },

    /// Error returned by the plugin's own logic over a healthy channel.
    #[error("plugin error during {operation}: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },

    #[error("plugin `{id}` does not declare capability `{capability}`")]
    CapabilityUnavailable { id: PluginId, capability: Capability },

    #[error("plugin `{id}` is not running")]
    NotRunning { id: PluginId },
}

impl Error {
    pub fn not_found(id: PluginId) -> Self {
        Self::NotFound { id }
    }

    pub fn spawn(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Spawn {
            path: path.into(),
            source,
        }
    }

    pub fn handshake(details: impl Into<String>) -> Self {
        Self::Handshake {
            details: details.into(),
        }
    }

    pub fn rpc(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Rpc {
            operation,
            details: details.into(),
        }
    }

    pub fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Remote {
            operation,
            message: message.into(),
        }
    }

    pub fn capability_unavailable(id: PluginId, capability: Capability) -> Self {
        Self::CapabilityUnavailable { id, capability }
    }

    pub fn not_running(id: PluginId) -> Self {
        Self::NotRunning { id }
    }

    /// Transport-level failures degrade the record to `Error`; everything
    /// else leaves host-side state untouched.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Rpc { .. } | Self::Handshake { .. })
    }
}
