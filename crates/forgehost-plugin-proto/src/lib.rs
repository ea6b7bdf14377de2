//! Wire protocol between the forgehost host process and plugin executables.
//!
//! A plugin is an independently-compiled executable that talks
//! length-prefixed postcard frames over its stdio. The host authenticates a
//! freshly spawned process with a magic-cookie environment variable plus a
//! version-gated `Hello` exchange before trusting any call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bumped on any incompatible change to [`Request`]/[`Response`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable the host sets on every spawned plugin process.
pub const HANDSHAKE_COOKIE_KEY: &str = "FORGEHOST_PLUGIN";
/// Expected value of [`HANDSHAKE_COOKIE_KEY`].
pub const HANDSHAKE_COOKIE_VALUE: &str = "hello";
/// Environment variable carrying the host's protocol version.
pub const HANDSHAKE_VERSION_KEY: &str = "FORGEHOST_PLUGIN_PROTOCOL_VERSION";

/// Static protocol identity shared by host and plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            cookie_key: HANDSHAKE_COOKIE_KEY.to_string(),
            cookie_value: HANDSHAKE_COOKIE_VALUE.to_string(),
        }
    }
}

impl HandshakeConfig {
    /// The host must refuse to launch plugins with a descriptor whose version
    /// differs from the one this crate was compiled against.
    pub fn is_version_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }

    /// Plugin-side check: was this process launched by a real host?
    ///
    /// Plugin executables call this first and exit non-zero when it fails, so
    /// a plugin started by hand prints nothing confusing onto a terminal.
    pub fn check_env(&self) -> bool {
        std::env::var(&self.cookie_key)
            .map(|value| value == self.cookie_value)
            .unwrap_or(false)
    }
}

/// The closed set of capabilities a plugin can serve.
///
/// `Plugin` is mandatory and only carries `Details`; `Router` and `Method`
/// are opt-in and advertised through [`PluginDetails::capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Plugin,
    Router,
    Method,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Plugin => "plugin",
            Capability::Router => "router",
            Capability::Method => "method",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State a plugin reports about itself inside [`PluginDetails`].
///
/// Purely informational: the host never derives its own lifecycle state
/// from it, only from process and transport health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredState {
    Running,
    Busy,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDetails {
    pub name: String,
    pub version: String,
    pub description: String,
    pub state: DeclaredState,
    pub capabilities: Vec<Capability>,
}

impl PluginDetails {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// One capability-scoped remote call. Every proxy on the host side reduces
/// to a `Call` variant; every plugin dispatches on the same enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    Details,
    Routes,
    HandleRoute { key: String },
    Methods,
    GetMethod { key: String },
}

impl Call {
    /// Capability that must be declared for this call to be dispatched.
    pub fn capability(&self) -> Capability {
        match self {
            Call::Details => Capability::Plugin,
            Call::Routes | Call::HandleRoute { .. } => Capability::Router,
            Call::Methods | Call::GetMethod { .. } => Capability::Method,
        }
    }

    /// Capability-namespaced method name, used in logs and error messages.
    pub fn rpc_name(&self) -> &'static str {
        match self {
            Call::Details => "Plugin.Details",
            Call::Routes => "Router.Routes",
            Call::HandleRoute { .. } => "Router.Handle",
            Call::Methods => "Method.Methods",
            Call::GetMethod { .. } => "Method.Get",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Hello { version: u32 },
    Call(Call),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    HelloOk { version: u32 },
    Details(PluginDetails),
    Keys(Vec<String>),
    Done,
    /// Error produced by the plugin's own logic, as opposed to a transport
    /// failure. Does not mean the process is unhealthy.
    Err {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Response),
}

/// Sanity limit on a single frame. Capability calls carry route/method keys
/// and details blobs, never bulk data.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn write_frame<W: std::io::Write, T: Serialize>(mut w: W, msg: &T) -> Result<(), ProtoError> {
    let payload = postcard::to_stdvec(msg)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: std::io::Read, T: for<'de> Deserialize<'de>>(
    mut r: R,
) -> Result<T, ProtoError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large").into());
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(postcard::from_bytes(&payload)?)
}
