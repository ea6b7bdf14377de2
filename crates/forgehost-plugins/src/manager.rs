use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use forgehost_plugin_proto::{Call, Capability, PluginDetails};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::client::PluginClient;
use crate::config::HostConfig;
use crate::discover::discover_plugins;
use crate::error::{Error, Result};
use crate::process::{CommandLauncher, PluginLauncher};

/// Identifier of one managed plugin. Monotonic per manager, never reused,
/// even after the plugin is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub u64);

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Host-side view of a plugin's lifecycle. Computed from process and
/// transport health only; a plugin's self-declared state never feeds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Registered, no live process. The starting point and the state after
    /// every `stop`.
    Boot,
    /// Handshake succeeded, channel idle.
    Ready,
    /// At least one capability call in flight.
    Working,
    /// Spawn, handshake, or transport failure. Stays until an explicit
    /// `stop` + `start`; there is no self-healing.
    Error,
}

struct PluginRecord {
    id: PluginId,
    path: PathBuf,
    state: PluginState,
    client: Option<Arc<PluginClient>>,
    details: Option<PluginDetails>,
    capabilities: HashSet<Capability>,
    /// Bumped every time the process session changes (start, stop, channel
    /// failure). A call outcome only commits if the session it started
    /// against is still the current one.
    generation: u64,
    /// Calls in flight against the current generation.
    in_flight: u32,
}

impl PluginRecord {
    fn new(id: PluginId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            state: PluginState::Boot,
            client: None,
            details: None,
            capabilities: HashSet::new(),
            generation: 0,
            in_flight: 0,
        }
    }
}

/// Snapshot of one record, for listing and introspection.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub id: PluginId,
    pub path: PathBuf,
    pub state: PluginState,
    pub details: Option<PluginDetails>,
}

/// Thread-safe catalogue of plugin records; the only component allowed to
/// mutate the id map or the counter.
///
/// Lifecycle operations (`add`, `start`, `stop`, `remove`) hold the registry
/// lock for their full duration, so they serialize across all plugins.
/// Capability calls take the lock only to fetch the client and flip state,
/// then run the round-trip unlocked; a concurrent `stop` surfaces to the
/// in-flight caller as a transport failure, never as a torn record. Each
/// call commits its outcome against the process generation it started on,
/// so a failure left over from a stopped session cannot degrade a
/// restarted one.
pub struct Manager {
    config: HostConfig,
    launcher: Box<dyn PluginLauncher>,
    next_id: AtomicU64,
    plugins: Mutex<HashMap<PluginId, PluginRecord>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default(), Box::new(CommandLauncher))
    }

    pub fn with_config(config: HostConfig, launcher: Box<dyn PluginLauncher>) -> Self {
        Self {
            config,
            launcher,
            next_id: AtomicU64::new(0),
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide shared manager, created on first access.
    ///
    /// Prefer constructing a [`Manager`] at the composition root and passing
    /// it down; this exists for call sites that genuinely need process-wide
    /// sharing.
    pub fn shared() -> &'static Manager {
        static SHARED: OnceLock<Manager> = OnceLock::new();
        SHARED.get_or_init(Manager::new)
    }

    /// Registers a plugin executable. Never fails; path validity is checked
    /// lazily by [`Manager::start`].
    pub fn add(&self, path: impl Into<PathBuf>) -> PluginId {
        let path = path.into();
        let id = PluginId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.plugins
            .lock()
            .insert(id, PluginRecord::new(id, path.clone()));
        info!(
            target: "forgehost_plugins::manager",
            plugin_id = %id,
            path = %path.display(),
            "plugin registered"
        );
        id
    }

    /// Registers every executable candidate under `dir`.
    pub fn add_discovered(&self, dir: impl AsRef<Path>) -> Vec<PluginId> {
        discover_plugins(dir)
            .into_iter()
            .map(|path| self.add(path))
            .collect()
    }

    /// Spawns the plugin process, performs the handshake, and fetches the
    /// initial details. Already-running plugins are left alone.
    pub fn start(&self, id: PluginId) -> Result<()> {
        let mut plugins = self.plugins.lock();
        let record = plugins.get_mut(&id).ok_or_else(|| Error::not_found(id))?;
        if matches!(record.state, PluginState::Ready | PluginState::Working) {
            return Ok(());
        }

        let client = match self.launch_and_handshake(&record.path) {
            Ok(client) => client,
            Err(error) => {
                record.state = PluginState::Error;
                record.client = None;
                warn!(
                    target: "forgehost_plugins::manager",
                    plugin_id = %id,
                    path = %record.path.display(),
                    error = %error,
                    "plugin start failed"
                );
                return Err(error);
            }
        };

        match client.details() {
            Ok(details) => {
                info!(
                    target: "forgehost_plugins::manager",
                    plugin_id = %id,
                    name = %details.name,
                    version = %details.version,
                    capabilities = ?details.capabilities,
                    "plugin started"
                );
                record.capabilities = details.capabilities.iter().copied().collect();
                record.details = Some(details);
                record.client = Some(client);
                record.state = PluginState::Ready;
                record.generation = record.generation.wrapping_add(1);
                record.in_flight = 0;
                Ok(())
            }
            Err(error) => {
                // Handshaken but unable to answer Details: not trustworthy.
                record.state = PluginState::Error;
                record.client = None;
                warn!(
                    target: "forgehost_plugins::manager",
                    plugin_id = %id,
                    error = %error,
                    "plugin answered handshake but failed initial details"
                );
                Err(error)
            }
        }
    }

    /// Terminates the plugin process if one is running and resets the record
    /// to `Boot`. Idempotent: stopping a stopped plugin is a no-op.
    pub fn stop(&self, id: PluginId) -> Result<()> {
        let client = {
            let mut plugins = self.plugins.lock();
            let record = plugins.get_mut(&id).ok_or_else(|| Error::not_found(id))?;
            record.state = PluginState::Boot;
            record.generation = record.generation.wrapping_add(1);
            record.in_flight = 0;
            record.client.take()
        };

        if let Some(client) = client {
            client.shutdown();
            if let Err(error) = client.terminate(self.config.stop_grace) {
                warn!(
                    target: "forgehost_plugins::manager",
                    plugin_id = %id,
                    error = %error,
                    "plugin termination reported an error"
                );
            }
            info!(
                target: "forgehost_plugins::manager",
                plugin_id = %id,
                "plugin stopped"
            );
        }
        Ok(())
    }

    /// Stops the plugin and erases its record. The id is never reissued.
    pub fn remove(&self, id: PluginId) -> Result<()> {
        self.stop(id)?;
        self.plugins
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::not_found(id))?;
        info!(
            target: "forgehost_plugins::manager",
            plugin_id = %id,
            "plugin removed"
        );
        Ok(())
    }

    /// Live `Plugin.Details` round-trip; refreshes the cached details and
    /// capability set on success.
    pub fn details(&self, id: PluginId) -> Result<PluginDetails> {
        let details = self.with_client(id, Capability::Plugin, |client| client.details())?;
        let mut plugins = self.plugins.lock();
        if let Some(record) = plugins.get_mut(&id) {
            record.capabilities = details.capabilities.iter().copied().collect();
            record.details = Some(details.clone());
        }
        Ok(details)
    }

    /// Details cached by the last successful `start` or [`Manager::details`]
    /// call; does not touch the plugin process.
    pub fn cached_details(&self, id: PluginId) -> Result<Option<PluginDetails>> {
        let plugins = self.plugins.lock();
        let record = plugins.get(&id).ok_or_else(|| Error::not_found(id))?;
        Ok(record.details.clone())
    }

    pub fn state(&self, id: PluginId) -> Result<PluginState> {
        let plugins = self.plugins.lock();
        let record = plugins.get(&id).ok_or_else(|| Error::not_found(id))?;
        Ok(record.state)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.lock();
        let mut out: Vec<PluginInfo> = plugins
            .values()
            .map(|record| PluginInfo {
                id: record.id,
                path: record.path.clone(),
                state: record.state,
                details: record.details.clone(),
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    /// Typed router proxy. Fails if the plugin never declared the `router`
    /// capability in its details.
    pub fn router(&self, id: PluginId) -> Result<RouterProxy<'_>> {
        self.ensure_capability(id, Capability::Router)?;
        Ok(RouterProxy { manager: self, id })
    }

    /// Typed method-override proxy, gated like [`Manager::router`].
    pub fn method(&self, id: PluginId) -> Result<MethodProxy<'_>> {
        self.ensure_capability(id, Capability::Method)?;
        Ok(MethodProxy { manager: self, id })
    }

    fn launch_and_handshake(&self, path: &Path) -> Result<Arc<PluginClient>> {
        let transport = self.launcher.launch(path, &self.config.handshake)?;
        let client = Arc::new(PluginClient::new(transport, self.config.call_timeout));
        client.handshake(self.config.handshake_timeout)?;
        Ok(client)
    }

    fn ensure_capability(&self, id: PluginId, capability: Capability) -> Result<()> {
        let plugins = self.plugins.lock();
        let record = plugins.get(&id).ok_or_else(|| Error::not_found(id))?;
        if record.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(Error::capability_unavailable(id, capability))
        }
    }

    fn with_client<T>(
        &self,
        id: PluginId,
        capability: Capability,
        f: impl FnOnce(&PluginClient) -> Result<T>,
    ) -> Result<T> {
        let (client, generation) = self.begin_call(id, capability)?;
        let result = f(&client);
        let failed_transport = matches!(&result, Err(error) if error.is_transport());
        self.finish_call(id, generation, failed_transport);
        result
    }

    fn begin_call(
        &self,
        id: PluginId,
        capability: Capability,
    ) -> Result<(Arc<PluginClient>, u64)> {
        let mut plugins = self.plugins.lock();
        let record = plugins.get_mut(&id).ok_or_else(|| Error::not_found(id))?;
        match record.state {
            PluginState::Ready | PluginState::Working => {}
            // Fails before any transport round-trip.
            PluginState::Boot | PluginState::Error => return Err(Error::not_running(id)),
        }
        // `plugin` is mandatory; everything else must be declared.
        if capability != Capability::Plugin && !record.capabilities.contains(&capability) {
            return Err(Error::capability_unavailable(id, capability));
        }
        let client = record
            .client
            .clone()
            .ok_or_else(|| Error::not_running(id))?;
        record.in_flight += 1;
        record.state = PluginState::Working;
        Ok((client, record.generation))
    }

    fn finish_call(&self, id: PluginId, generation: u64, failed_transport: bool) {
        let mut plugins = self.plugins.lock();
        let Some(record) = plugins.get_mut(&id) else {
            return;
        };
        if record.generation != generation {
            // The session this call ran against is already gone; a stop,
            // restart, or channel failure moved the record on. The outcome
            // must not touch the current session.
            return;
        }
        record.in_flight = record.in_flight.saturating_sub(1);
        if record.state != PluginState::Working {
            return;
        }
        if failed_transport {
            record.state = PluginState::Error;
            record.client = None;
            record.generation = record.generation.wrapping_add(1);
            record.in_flight = 0;
            warn!(
                target: "forgehost_plugins::manager",
                plugin_id = %id,
                "plugin channel failed; record degraded to error"
            );
        } else if record.in_flight == 0 {
            record.state = PluginState::Ready;
        }
    }
}

/// Remote-call wrapper for a plugin's `router` capability.
pub struct RouterProxy<'m> {
    manager: &'m Manager,
    id: PluginId,
}

impl RouterProxy<'_> {
    /// Route patterns the plugin wants to own. Re-callable any time the
    /// plugin is running.
    pub fn routes(&self) -> Result<Vec<String>> {
        self.manager
            .with_client(self.id, Capability::Router, |client| {
                client.expect_keys(Call::Routes)
            })
    }

    /// Dispatches the plugin's handler for one route key.
    pub fn handle(&self, key: &str) -> Result<()> {
        self.manager
            .with_client(self.id, Capability::Router, |client| {
                client.expect_done(Call::HandleRoute {
                    key: key.to_string(),
                })
            })
    }
}

/// Remote-call wrapper for a plugin's `method` override capability.
pub struct MethodProxy<'m> {
    manager: &'m Manager,
    id: PluginId,
}

impl std::fmt::Debug for MethodProxy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodProxy").field("id", &self.id).finish()
    }
}

impl MethodProxy<'_> {
    pub fn methods(&self) -> Result<Vec<String>> {
        self.manager
            .with_client(self.id, Capability::Method, |client| {
                client.expect_keys(Call::Methods)
            })
    }

    pub fn get(&self, key: &str) -> Result<()> {
        self.manager
            .with_client(self.id, Capability::Method, |client| {
                client.expect_done(Call::GetMethod {
                    key: key.to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use forgehost_plugin_proto::{
        DeclaredState, HandshakeConfig, Request, Response, PROTOCOL_VERSION,
    };

    use super::*;
    use crate::process::PluginTransport;

    /// Behavior knobs shared by a fake launcher and every transport it hands
    /// out, so tests can flip failure modes mid-run and count round-trips.
    #[derive(Debug)]
    struct FakeBehavior {
        capabilities: Vec<Capability>,
        routes: Vec<String>,
        methods: Vec<String>,
        hello_version: u32,
        fail_spawn: AtomicBool,
        refuse_handshake: AtomicBool,
        dead: AtomicBool,
        round_trips: AtomicUsize,
        launches: AtomicUsize,
    }

    impl FakeBehavior {
        fn full() -> Arc<Self> {
            Arc::new(Self {
                capabilities: vec![Capability::Plugin, Capability::Router, Capability::Method],
                routes: vec!["/demo".to_string(), "/demo/settings".to_string()],
                methods: vec!["avatar.render".to_string()],
                hello_version: PROTOCOL_VERSION,
                fail_spawn: AtomicBool::new(false),
                refuse_handshake: AtomicBool::new(false),
                dead: AtomicBool::new(false),
                round_trips: AtomicUsize::new(0),
                launches: AtomicUsize::new(0),
            })
        }

        fn with_capabilities(capabilities: Vec<Capability>) -> Arc<Self> {
            let behavior = Self::full();
            Arc::new(Self {
                capabilities,
                ..Arc::try_unwrap(behavior).expect("fresh behavior is unshared")
            })
        }

        fn details(&self) -> PluginDetails {
            PluginDetails {
                name: "fake".to_string(),
                version: "0.0.0".to_string(),
                description: "in-process fake plugin".to_string(),
                state: DeclaredState::Running,
                capabilities: self.capabilities.clone(),
            }
        }
    }

    #[derive(Debug)]
    struct FakeTransport {
        behavior: Arc<FakeBehavior>,
        pending: VecDeque<Vec<u8>>,
    }

    impl FakeTransport {
        fn respond(&self, request: Request) -> Response {
            let behavior = &self.behavior;
            match request {
                Request::Hello { version } => {
                    if version == behavior.hello_version {
                        Response::HelloOk { version }
                    } else {
                        Response::Err {
                            message: "version mismatch".to_string(),
                        }
                    }
                }
                Request::Call(Call::Details) => Response::Details(behavior.details()),
                Request::Call(Call::Routes) => Response::Keys(behavior.routes.clone()),
                Request::Call(Call::HandleRoute { key }) => {
                    if behavior.routes.contains(&key) {
                        Response::Done
                    } else {
                        Response::Err {
                            message: format!("unknown route: {key}"),
                        }
                    }
                }
                Request::Call(Call::Methods) => Response::Keys(behavior.methods.clone()),
                Request::Call(Call::GetMethod { key }) => {
                    if behavior.methods.contains(&key) {
                        Response::Done
                    } else {
                        Response::Err {
                            message: format!("unknown method: {key}"),
                        }
                    }
                }
                Request::Shutdown => Response::Done,
            }
        }
    }

    impl PluginTransport for FakeTransport {
        fn send(&mut self, frame: &[u8]) -> Result<()> {
            if self.behavior.dead.load(Ordering::SeqCst) {
                return Err(Error::rpc("send", "plugin closed the channel"));
            }
            let request: Request =
                postcard::from_bytes(&frame[4..]).expect("host sent a valid frame");
            if matches!(request, Request::Hello { .. })
                && self.behavior.refuse_handshake.load(Ordering::SeqCst)
            {
                return Err(Error::rpc("send", "plugin closed the channel"));
            }
            self.behavior.round_trips.fetch_add(1, Ordering::SeqCst);
            let response = self.respond(request);
            self.pending
                .push_back(postcard::to_stdvec(&response).expect("encode response"));
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
            if self.behavior.dead.load(Ordering::SeqCst) {
                return Err(Error::rpc("recv", "plugin closed the channel"));
            }
            self.pending
                .pop_front()
                .ok_or_else(|| Error::rpc("recv", format!("timed out after {timeout:?}")))
        }

        fn terminate(&mut self, _grace: Duration) -> Result<()> {
            Ok(())
        }
    }

    struct FakeLauncher {
        behavior: Arc<FakeBehavior>,
    }

    impl PluginLauncher for FakeLauncher {
        fn launch(
            &self,
            path: &Path,
            _handshake: &HandshakeConfig,
        ) -> Result<Box<dyn PluginTransport>> {
            if self.behavior.fail_spawn.load(Ordering::SeqCst) {
                return Err(Error::spawn(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                ));
            }
            self.behavior.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTransport {
                behavior: self.behavior.clone(),
                pending: VecDeque::new(),
            }))
        }
    }

    fn manager_with(behavior: Arc<FakeBehavior>) -> Manager {
        Manager::with_config(HostConfig::default(), Box::new(FakeLauncher { behavior }))
    }

    #[test]
    fn add_assigns_monotonic_ids_from_zero() {
        let manager = manager_with(FakeBehavior::full());
        assert_eq!(manager.add("/p/a"), PluginId(0));
        assert_eq!(manager.add("/p/b"), PluginId(1));
        assert_eq!(manager.add("/p/c"), PluginId(2));
    }

    #[test]
    fn concurrent_adds_yield_distinct_ids() {
        let manager = Arc::new(manager_with(FakeBehavior::full()));
        let mut handles = Vec::new();
        for t in 0..8 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .map(|i| manager.add(format!("/p/{t}-{i}")))
                    .collect::<Vec<_>>()
            }));
        }
        let mut ids: Vec<PluginId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("adder thread"))
            .collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
        assert_eq!(ids.len(), 400);
    }

    #[test]
    fn start_unknown_id_is_not_found() {
        let manager = manager_with(FakeBehavior::full());
        let err = manager.start(PluginId(42)).expect_err("must not start");
        assert!(matches!(err, Error::NotFound { id } if id == PluginId(42)));
    }

    #[test]
    fn start_populates_details_and_capabilities() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);

        manager.start(id).expect("start");
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);

        let cached = manager
            .cached_details(id)
            .expect("record exists")
            .expect("details cached by start");
        assert_eq!(cached.name, "fake");
        assert!(!cached.capabilities.is_empty());
    }

    #[test]
    fn start_twice_reuses_the_running_process() {
        let behavior = FakeBehavior::full();
        let manager = manager_with(behavior.clone());
        let id = manager.add("/p/demo");
        manager.start(id).expect("first start");
        manager.start(id).expect("second start is a no-op");
        assert_eq!(behavior.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawn_failure_leaves_record_in_error() {
        let behavior = FakeBehavior::full();
        behavior.fail_spawn.store(true, Ordering::SeqCst);
        let manager = manager_with(behavior);
        let id = manager.add("/p/missing");
        let err = manager.start(id).expect_err("spawn must fail");
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(manager.state(id).expect("state"), PluginState::Error);
    }

    #[test]
    fn handshake_failure_then_stop_then_remove() {
        let behavior = FakeBehavior::full();
        behavior.refuse_handshake.store(true, Ordering::SeqCst);
        let manager = manager_with(behavior);

        let id = manager.add("/bin/true");
        assert_eq!(id, PluginId(0));

        let err = manager.start(id).expect_err("handshake must fail");
        assert!(matches!(err, Error::Handshake { .. }));
        assert_eq!(manager.state(id).expect("state"), PluginState::Error);

        manager.stop(id).expect("stop resets the record");
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);

        manager.remove(id).expect("remove");
        assert!(matches!(
            manager.state(id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        manager.stop(id).expect("first stop");
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);
        manager.stop(id).expect("second stop is a no-op");
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);
    }

    #[test]
    fn stop_then_restart_spawns_a_fresh_process() {
        let behavior = FakeBehavior::full();
        let manager = manager_with(behavior.clone());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");
        manager.stop(id).expect("stop");
        manager.start(id).expect("restart");
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);
        assert_eq!(behavior.launches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_then_start_on_stale_id_is_not_found() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.remove(id).expect("remove");
        assert!(matches!(manager.start(id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn router_proxy_lists_routes_and_dispatches() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        let router = manager.router(id).expect("router capability declared");
        assert_eq!(
            router.routes().expect("routes"),
            vec!["/demo".to_string(), "/demo/settings".to_string()]
        );
        router.handle("/demo").expect("known route dispatches");
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);
    }

    #[test]
    fn remote_error_does_not_degrade_the_record() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        let method = manager.method(id).expect("method capability declared");
        let err = method.get("no.such.method").expect_err("unknown key");
        assert!(matches!(err, Error::Remote { .. }));
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);

        // Channel is still healthy after the remote error.
        assert_eq!(
            method.methods().expect("methods"),
            vec!["avatar.render".to_string()]
        );
    }

    #[test]
    fn transport_failure_degrades_record_to_error() {
        let behavior = FakeBehavior::full();
        let manager = manager_with(behavior.clone());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        behavior.dead.store(true, Ordering::SeqCst);
        let router = manager.router(id).expect("router");
        let err = router.routes().expect_err("channel is dead");
        assert!(matches!(err, Error::Rpc { .. }));
        assert_eq!(manager.state(id).expect("state"), PluginState::Error);
    }

    #[test]
    fn stale_call_failure_does_not_poison_a_restarted_session() {
        let behavior = FakeBehavior::full();
        let manager = manager_with(behavior.clone());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start first session");

        // A call begins against the first session and stays parked while
        // the plugin is stopped and started again underneath it.
        let (stale_client, stale_generation) = manager
            .begin_call(id, Capability::Router)
            .expect("call in flight on first session");
        manager.stop(id).expect("stop first session");
        manager.start(id).expect("start second session");
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);

        // The parked call now observes its channel dying. The failure
        // belongs to the old session and must not touch the new one.
        manager.finish_call(id, stale_generation, true);
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);
        drop(stale_client);

        let router = manager.router(id).expect("router");
        assert_eq!(
            router.routes().expect("second session serves calls"),
            vec!["/demo".to_string(), "/demo/settings".to_string()]
        );
        assert_eq!(behavior.launches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_call_failure_after_stop_leaves_record_in_boot() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        let (stale_client, stale_generation) = manager
            .begin_call(id, Capability::Router)
            .expect("call in flight");
        manager.stop(id).expect("stop races the call");
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);

        manager.finish_call(id, stale_generation, true);
        drop(stale_client);
        assert_eq!(manager.state(id).expect("state"), PluginState::Boot);
    }

    #[test]
    fn overlapping_calls_keep_record_working_until_the_last_finishes() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        let (first, generation) = manager
            .begin_call(id, Capability::Router)
            .expect("first call");
        let (second, second_generation) = manager
            .begin_call(id, Capability::Method)
            .expect("second call");
        assert_eq!(generation, second_generation);
        assert_eq!(manager.state(id).expect("state"), PluginState::Working);

        manager.finish_call(id, generation, false);
        assert_eq!(manager.state(id).expect("state"), PluginState::Working);

        manager.finish_call(id, second_generation, false);
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);
        drop(first);
        drop(second);
    }

    #[test]
    fn call_in_error_state_fails_without_a_round_trip() {
        let behavior = FakeBehavior::full();
        let manager = manager_with(behavior.clone());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        behavior.dead.store(true, Ordering::SeqCst);
        let _ = manager.router(id).expect("router").routes();
        assert_eq!(manager.state(id).expect("state"), PluginState::Error);

        let trips_before = behavior.round_trips.load(Ordering::SeqCst);
        let err = manager.details(id).expect_err("record is in error");
        assert!(matches!(err, Error::NotRunning { .. }));
        assert_eq!(behavior.round_trips.load(Ordering::SeqCst), trips_before);
    }

    #[test]
    fn undeclared_capability_is_a_caller_error() {
        let behavior =
            FakeBehavior::with_capabilities(vec![Capability::Plugin, Capability::Router]);
        let manager = manager_with(behavior);
        let id = manager.add("/p/router-only");
        manager.start(id).expect("start");

        assert!(manager.router(id).is_ok());
        let err = manager.method(id).expect_err("method never declared");
        assert!(matches!(
            err,
            Error::CapabilityUnavailable {
                capability: Capability::Method,
                ..
            }
        ));
    }

    #[test]
    fn details_call_refreshes_the_cache() {
        let manager = manager_with(FakeBehavior::full());
        let id = manager.add("/p/demo");
        manager.start(id).expect("start");

        let live = manager.details(id).expect("live details");
        assert_eq!(live.state, DeclaredState::Running);
        assert_eq!(
            manager.cached_details(id).expect("record").as_ref(),
            Some(&live)
        );
        assert_eq!(manager.state(id).expect("state"), PluginState::Ready);
    }

    #[test]
    fn list_reports_records_in_id_order() {
        let manager = manager_with(FakeBehavior::full());
        let b = manager.add("/p/b");
        let a = manager.add("/p/a");
        manager.start(a).expect("start");

        let infos = manager.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, b);
        assert_eq!(infos[0].state, PluginState::Boot);
        assert_eq!(infos[1].id, a);
        assert_eq!(infos[1].state, PluginState::Ready);
    }
}
