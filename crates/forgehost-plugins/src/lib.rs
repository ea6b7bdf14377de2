//! forgehost-plugins: the host side of the forgehost plugin system.
//!
//! Loads, starts, supervises, and tears down independently-compiled plugin
//! executables, and exposes typed, capability-scoped remote calls (routing,
//! method overriding) back into the host application. Plugins speak the
//! `forgehost-plugin-proto` frame protocol over stdio and are authenticated
//! with a version-gated magic-cookie handshake before any call is trusted.
//!
//! ```no_run
//! use forgehost_plugins::Manager;
//!
//! let manager = Manager::new();
//! let id = manager.add("/usr/libexec/forgehost/plugins/hello");
//! manager.start(id)?;
//! for route in manager.router(id)?.routes()? {
//!     println!("plugin owns {route}");
//! }
//! manager.stop(id)?;
//! # Ok::<(), forgehost_plugins::Error>(())
//! ```

mod client;
mod config;
mod discover;
mod error;
mod manager;
mod process;

pub use client::PluginClient;
pub use config::HostConfig;
pub use discover::discover_plugins;
pub use error::{Error, Result};
pub use manager::{Manager, MethodProxy, PluginId, PluginInfo, PluginState, RouterProxy};
pub use process::{CommandLauncher, PluginLauncher, PluginTransport};

pub use forgehost_plugin_proto as proto;
