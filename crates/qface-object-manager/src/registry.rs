//! The registry: per-connection state, local/remote object maps, and the
//! connection-keyed singleton accessor.
//!
//! A process can hold several D-Bus connections (session and system bus, or
//! several private connections in tests); each gets its own
//! [`RegistryState`], keyed by the connection's unique name. A prior design
//! that guarded a single global `OnceCell` made every connection after the
//! first silently reuse the first connection's registry — this keys the
//! cell map instead.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
};

use derive_more::Debug;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use zbus::{
    fdo::{DBusProxy, ObjectManagerProxy, RequestNameFlags},
    names::{BusName, OwnedUniqueName},
    zvariant::OwnedObjectPath,
    Connection,
};

use crate::{
    config::ServiceNamePattern,
    emitter::ManagedObjectsEmitter,
    error::Error,
    introspection::{IntrospectableInterface, ObjectManagerInterface},
    observer::{InterfacesAddedObserver, InterfacesRemovedObserver, ObserverList},
    signal_pump,
    types::{InterfaceMap, ManagedObjects, ROOT_PATH},
};

type SingletonCell = Arc<OnceCell<Arc<RegistryState>>>;
type SingletonMap = Mutex<HashMap<OwnedUniqueName, SingletonCell>>;

fn singletons() -> &'static SingletonMap {
    static SINGLETONS: OnceLock<SingletonMap> = OnceLock::new();
    SINGLETONS.get_or_init(Default::default)
}

/// Returns this connection's [`RegistryState`], creating and initializing
/// it on first call.
///
/// Initialization runs exactly once per unique connection name even under
/// concurrent callers: later callers await the same in-flight
/// initialization instead of racing a second one.
///
/// # Errors
/// Propagates whatever [`RegistryState::init`] returns. A failed
/// initialization is not cached — the next call retries from scratch.
#[instrument(skip(connection))]
pub async fn registry(connection: &Connection) -> Result<Arc<RegistryState>, Error> {
    let unique_name = connection
        .unique_name()
        .ok_or(Error::NoUniqueName)?
        .to_owned();

    let cell = {
        #[allow(clippy::expect_used)]
        let mut map = singletons().lock().expect("singleton map poisoned");
        map.entry(unique_name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    };

    cell.get_or_try_init(|| async {
        RegistryState::init(connection.clone(), unique_name.clone()).await
    })
    .await
    .cloned()
}

/// A remote object this registry learned about from a watched peer: which
/// peer owns it and the interfaces it was last reported to export.
#[derive(Debug, Clone)]
pub(crate) struct RemoteEntry {
    pub(crate) owner: OwnedUniqueName,
    pub(crate) interfaces: InterfaceMap,
}

#[derive(Debug, Default)]
pub(crate) struct RegistryMaps {
    /// Interfaces this connection itself exports, keyed by object path.
    pub(crate) local: HashMap<OwnedObjectPath, InterfaceMap>,
    /// Interfaces exported by watched peers, keyed by object path. A path
    /// is owned by at most one peer at a time.
    pub(crate) remote: HashMap<OwnedObjectPath, RemoteEntry>,
    /// Unique names of peers this registry is currently watching. Signals
    /// from any other sender are ignored even if they match the Object
    /// Manager interface and member — a peer only starts contributing to
    /// `remote` once its well-known name matched the service pattern and
    /// its initial `GetManagedObjects` round trip was attempted.
    pub(crate) watched: HashSet<OwnedUniqueName>,
}

impl RegistryMaps {
    /// Records a remote object unless `path` is already owned by a
    /// different peer, in which case the prior mapping is kept and the
    /// caller is told so it can log the conflict. Mirrors the original's
    /// `objectServices[objectPath]` ownership check.
    pub(crate) fn insert_remote(
        &mut self,
        path: OwnedObjectPath,
        owner: OwnedUniqueName,
        interfaces: InterfaceMap,
    ) -> bool {
        match self.remote.get(&path) {
            Some(existing) if existing.owner != owner => false,
            _ => {
                self.remote.insert(path, RemoteEntry { owner, interfaces });
                true
            }
        }
    }

    /// Removes `path` from the remote map only if `owner` is the peer
    /// currently on record for it. Returns whether a removal happened.
    pub(crate) fn remove_remote_if_owner(
        &mut self,
        path: &OwnedObjectPath,
        owner: &OwnedUniqueName,
    ) -> bool {
        match self.remote.get(path) {
            Some(entry) if &entry.owner == owner => {
                self.remote.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Drops every remote object attributed to `owner`, returning the
    /// paths that were removed so the caller can notify observers.
    pub(crate) fn remove_remote_owned_by(
        &mut self,
        owner: &OwnedUniqueName,
    ) -> Vec<OwnedObjectPath> {
        let paths: Vec<OwnedObjectPath> = self
            .remote
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &paths {
            self.remote.remove(path);
        }
        paths
    }
}

/// The connection-independent half of [`RegistryState`]: the object maps,
/// observer lists, and the emission seam. Split out so it can be
/// constructed directly in tests without a live `Connection`, the same
/// motivation behind the [`ManagedObjectsEmitter`] trait itself.
#[derive(Debug)]
pub(crate) struct RegistryCore {
    pub(crate) unique_name: OwnedUniqueName,
    pub(crate) maps: Mutex<RegistryMaps>,
    #[debug(skip)]
    pub(crate) added_observers: ObserverList<dyn InterfacesAddedObserver>,
    #[debug(skip)]
    pub(crate) removed_observers: ObserverList<dyn InterfacesRemovedObserver>,
    #[debug(skip)]
    pub(crate) emitter: Arc<dyn ManagedObjectsEmitter>,
}

impl RegistryCore {
    fn new(unique_name: OwnedUniqueName, emitter: Arc<dyn ManagedObjectsEmitter>) -> Self {
        Self {
            unique_name,
            maps: Mutex::new(RegistryMaps::default()),
            added_observers: ObserverList::default(),
            removed_observers: ObserverList::default(),
            emitter,
        }
    }

    /// Registers a locally-exported object, panicking if `path` is already
    /// registered — a generated adapter registering twice is a programming
    /// error, not a runtime condition to recover from — or if `path` has
    /// fewer than two `/`-separated segments, mirroring the original's
    /// `log.Fatalf` on a malformed path.
    #[instrument(skip(self, interfaces), fields(path = %path))]
    async fn register(&self, path: OwnedObjectPath, interfaces: InterfaceMap) {
        let segment_count = path
            .as_str()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .count();
        if segment_count < 2 {
            panic!("malformed object path {path}: at least two segments required");
        }

        {
            #[allow(clippy::expect_used)]
            let mut maps = self.maps.lock().expect("registry maps poisoned");
            if maps.local.insert(path.clone(), interfaces.clone()).is_some() {
                panic!("object already registered at {path}");
            }
        }

        if let Err(error) = self.emitter.emit_interfaces_added(&path, &interfaces).await {
            warn!(%error, %path, "cannot emit InterfacesAdded for local object");
        }
        let own_name = self.unique_name.clone();
        self.notify_added(&own_name, &path);
    }

    /// Unregisters a locally-exported object, panicking if `path` was never
    /// registered. `interface_names` is supplied by the caller (the
    /// generated adapter knows which interfaces it tore down) rather than
    /// derived from the local map, matching `UnregisterObject(objectPath,
    /// interfaces)` in the original.
    #[instrument(skip(self, interface_names), fields(path = %path))]
    async fn unregister(&self, path: &OwnedObjectPath, interface_names: &[String]) {
        {
            #[allow(clippy::expect_used)]
            let mut maps = self.maps.lock().expect("registry maps poisoned");
            maps.local
                .remove(path)
                .unwrap_or_else(|| panic!("object not registered at {path}"));
        }

        if let Err(error) = self
            .emitter
            .emit_interfaces_removed(path, interface_names)
            .await
        {
            warn!(%error, %path, "cannot emit InterfacesRemoved for local object");
        }
        let own_name = self.unique_name.clone();
        self.notify_removed(&own_name, path);
    }

    /// The merged view of every object this registry knows about: objects
    /// it exports itself plus objects exported by every watched peer.
    fn managed_objects(&self) -> ManagedObjects {
        #[allow(clippy::expect_used)]
        let maps = self.maps.lock().expect("registry maps poisoned");
        let mut merged = maps.local.clone();
        merged.extend(
            maps.remote
                .iter()
                .map(|(path, entry)| (path.clone(), entry.interfaces.clone())),
        );
        merged
    }

    /// The top-level node names for objects this connection exports
    /// itself — never remote ones, matching `objectNodes` in the original,
    /// which is only ever populated from `RegisterObject`.
    fn local_top_level_segments(&self) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let maps = self.maps.lock().expect("registry maps poisoned");
        maps.local
            .keys()
            .filter_map(|path| path.as_str().trim_start_matches('/').split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// The unique bus name that owns `path`, if known to this registry.
    fn object_service(&self, path: &OwnedObjectPath) -> Option<OwnedUniqueName> {
        #[allow(clippy::expect_used)]
        let maps = self.maps.lock().expect("registry maps poisoned");
        if maps.local.contains_key(path) {
            return Some(self.unique_name.clone());
        }
        maps.remote.get(path).map(|entry| entry.owner.clone())
    }

    pub(crate) fn notify_added(&self, peer: &OwnedUniqueName, path: &OwnedObjectPath) {
        for observer in self.added_observers.snapshot() {
            let peer = peer.clone();
            let path = path.clone();
            tokio::spawn(async move {
                observer.on_interfaces_added(&peer, &path);
            });
        }
    }

    pub(crate) fn notify_removed(&self, peer: &OwnedUniqueName, path: &OwnedObjectPath) {
        for observer in self.removed_observers.snapshot() {
            let peer = peer.clone();
            let path = path.clone();
            tokio::spawn(async move {
                observer.on_interfaces_removed(&peer, &path);
            });
        }
    }
}

/// Per-connection Object Manager state: the connection itself, the
/// service-name pattern it watches peers against, and the
/// connection-independent [`RegistryCore`].
#[derive(Debug)]
pub struct RegistryState {
    #[debug(skip)]
    pub(crate) connection: Connection,
    pub(crate) pattern: ServiceNamePattern,
    pub(crate) core: RegistryCore,
}

impl RegistryState {
    #[instrument(skip(connection), fields(unique_name = %unique_name))]
    async fn init(connection: Connection, unique_name: OwnedUniqueName) -> Result<Arc<Self>, Error> {
        let pattern = ServiceNamePattern::from_env()?;

        let suffix: String = unique_name
            .as_str()
            .chars()
            .filter(|c| *c != '.' && *c != ':')
            .collect();
        let service_name = format!("{}.X{suffix}", pattern.as_str());

        connection
            .request_name_with_flags(service_name.as_str(), RequestNameFlags::DoNotQueue.into())
            .await
            .map_err(|source| Error::NameClaim {
                name: service_name,
                source,
            })?;

        let dbus_proxy = DBusProxy::new(&connection).await?;
        let names = dbus_proxy.list_names().await.map_err(Error::Enumeration)?;

        let state = Arc::new(Self {
            connection: connection.clone(),
            pattern,
            core: RegistryCore::new(unique_name.clone(), Arc::new(connection.clone())),
        });

        for name in names {
            if name.as_str() == unique_name.as_str() || !state.pattern.matches(name.as_str()) {
                continue;
            }

            let Ok(bus_name) = BusName::try_from(name.as_str()) else {
                continue;
            };
            let Ok(owner) = dbus_proxy.get_name_owner(bus_name).await else {
                continue;
            };

            state.watch_service(owner.into()).await;
        }

        connection
            .object_server()
            .at(
                ROOT_PATH,
                ObjectManagerInterface {
                    state: state.clone(),
                },
            )
            .await?;
        connection
            .object_server()
            .at(
                ROOT_PATH,
                IntrospectableInterface {
                    state: state.clone(),
                },
            )
            .await?;

        signal_pump::spawn(state.clone());

        Ok(state)
    }

    /// The bus name pattern this registry uses to recognize watched peers.
    pub fn service_name_pattern(&self) -> &ServiceNamePattern {
        &self.pattern
    }

    /// Registers a locally-exported object. See [`RegistryCore::register`].
    pub async fn register(&self, path: OwnedObjectPath, interfaces: InterfaceMap) {
        self.core.register(path, interfaces).await;
    }

    /// Unregisters a locally-exported object. See [`RegistryCore::unregister`].
    pub async fn unregister(&self, path: &OwnedObjectPath, interface_names: &[String]) {
        self.core.unregister(path, interface_names).await;
    }

    /// The merged view of every object this registry knows about.
    pub fn managed_objects(&self) -> ManagedObjects {
        self.core.managed_objects()
    }

    pub(crate) fn local_top_level_segments(&self) -> Vec<String> {
        self.core.local_top_level_segments()
    }

    /// The unique bus name that owns `path`, if known to this registry.
    pub fn object_service(&self, path: &OwnedObjectPath) -> Option<OwnedUniqueName> {
        self.core.object_service(path)
    }

    /// Registers `observer` for `InterfacesAdded` notifications.
    pub fn add_interfaces_added_observer(&self, observer: &Arc<dyn InterfacesAddedObserver>) {
        self.core.added_observers.add(observer);
    }

    /// Unregisters a previously-added `InterfacesAdded` observer.
    pub fn remove_interfaces_added_observer(&self, observer: &Arc<dyn InterfacesAddedObserver>) {
        self.core.added_observers.remove(observer);
    }

    /// Registers `observer` for `InterfacesRemoved` notifications.
    pub fn add_interfaces_removed_observer(&self, observer: &Arc<dyn InterfacesRemovedObserver>) {
        self.core.removed_observers.add(observer);
    }

    /// Unregisters a previously-added `InterfacesRemoved` observer.
    pub fn remove_interfaces_removed_observer(&self, observer: &Arc<dyn InterfacesRemovedObserver>) {
        self.core.removed_observers.remove(observer);
    }

    /// Starts watching `peer`: registers sender-scoped match rules for its
    /// `InterfacesAdded`/`InterfacesRemoved` signals, then fetches its
    /// current managed objects and relays them as `InterfacesAdded` for
    /// each. Peers that don't implement the Object Manager interface are
    /// silently skipped — not every bus name matching the service pattern
    /// is required to export one.
    #[instrument(skip(self), fields(peer = %peer))]
    pub(crate) async fn watch_service(&self, peer: OwnedUniqueName) {
        {
            #[allow(clippy::expect_used)]
            let mut maps = self.core.maps.lock().expect("registry maps poisoned");
            maps.watched.insert(peer.clone());
        }

        if let Err(error) = signal_pump::add_peer_match_rules(&self.connection, &peer).await {
            warn!(%error, %peer, "failed to register match rules for watched peer");
        }

        let Ok(object_manager) =
            ObjectManagerProxy::new(&self.connection, peer.as_str(), ROOT_PATH).await
        else {
            debug!(%peer, "peer does not export an object manager proxy");
            return;
        };

        let Ok(objects) = object_manager.get_managed_objects().await else {
            debug!(%peer, "peer object manager did not respond to GetManagedObjects");
            return;
        };

        for (path, interfaces) in objects {
            let inserted = {
                #[allow(clippy::expect_used)]
                let mut maps = self.core.maps.lock().expect("registry maps poisoned");
                maps.insert_remote(path.clone(), peer.clone(), interfaces)
            };
            if inserted {
                self.core.notify_added(&peer, &path);
            } else {
                warn!(%path, %peer, "object path already owned by another peer, ignoring");
            }
        }
    }

    /// Stops watching `peer`: removes its match rules, drops every remote
    /// object it owned, and notifies observers of each removal. Mirrors
    /// the original's `removeService`.
    #[instrument(skip(self), fields(peer = %peer))]
    pub(crate) async fn remove_service(&self, peer: OwnedUniqueName) {
        {
            #[allow(clippy::expect_used)]
            let mut maps = self.core.maps.lock().expect("registry maps poisoned");
            maps.watched.remove(&peer);
        }

        if let Err(error) = signal_pump::remove_peer_match_rules(&self.connection, &peer).await {
            debug!(%error, %peer, "failed to remove match rules for departed peer");
        }

        let removed_paths = {
            #[allow(clippy::expect_used)]
            let mut maps = self.core.maps.lock().expect("registry maps poisoned");
            maps.remove_remote_owned_by(&peer)
        };
        for path in removed_paths {
            self.core.notify_removed(&peer, &path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::emitter::recording::RecordingEmitter;

    fn unique_name(value: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(value).unwrap()
    }

    fn path(value: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(value).unwrap()
    }

    fn core() -> RegistryCore {
        RegistryCore::new(unique_name(":1.1"), Arc::new(RecordingEmitter::default()))
    }

    mod register {
        use super::*;

        #[tokio::test]
        async fn adds_to_managed_objects_and_emits() {
            let core = core();

            core.register(path("/svc/a"), InterfaceMap::new()).await;

            assert!(core.managed_objects().contains_key(&path("/svc/a")));
        }

        #[tokio::test]
        #[should_panic(expected = "already registered")]
        async fn panics_on_duplicate_registration() {
            let core = core();

            core.register(path("/svc/a"), InterfaceMap::new()).await;
            core.register(path("/svc/a"), InterfaceMap::new()).await;
        }

        #[tokio::test]
        #[should_panic(expected = "malformed object path")]
        async fn panics_on_single_segment_path() {
            let core = core();

            core.register(path("/svc"), InterfaceMap::new()).await;
        }
    }

    mod unregister {
        use super::*;

        #[tokio::test]
        async fn removes_from_managed_objects() {
            let core = core();
            core.register(path("/svc/a"), InterfaceMap::new()).await;

            core.unregister(&path("/svc/a"), &["com.example.Foo".to_string()])
                .await;

            assert!(!core.managed_objects().contains_key(&path("/svc/a")));
        }

        #[tokio::test]
        #[should_panic(expected = "not registered")]
        async fn panics_on_unknown_path() {
            let core = core();

            core.unregister(&path("/svc/a"), &[]).await;
        }
    }

    mod managed_objects {
        use super::*;

        #[test]
        fn merges_local_and_remote_maps() {
            let mut maps = RegistryMaps::default();
            maps.local.insert(path("/local/a"), HashMap::new());
            maps.insert_remote(path("/remote/a"), unique_name(":1.2"), HashMap::new());

            let merged_paths: Vec<_> = {
                let mut merged = maps.local.clone();
                merged.extend(
                    maps.remote
                        .iter()
                        .map(|(path, entry)| (path.clone(), entry.interfaces.clone())),
                );
                merged.into_keys().collect()
            };

            assert_eq!(merged_paths.len(), 2);
        }
    }

    mod insert_remote {
        use super::*;

        #[test]
        fn rejects_conflicting_owner_and_keeps_prior_mapping() {
            let mut maps = RegistryMaps::default();
            maps.insert_remote(path("/svc/a"), unique_name(":1.1"), HashMap::new());

            let inserted = maps.insert_remote(path("/svc/a"), unique_name(":1.2"), HashMap::new());

            assert!(!inserted);
            assert_eq!(maps.remote[&path("/svc/a")].owner, unique_name(":1.1"));
        }
    }

    mod object_service {
        use super::*;

        #[test]
        fn finds_owner_of_remote_object() {
            let mut maps = RegistryMaps::default();
            let owner = unique_name(":1.9");
            maps.insert_remote(path("/remote/a"), owner.clone(), HashMap::new());

            assert_eq!(
                maps.remote.get(&path("/remote/a")).map(|entry| entry.owner.clone()),
                Some(owner)
            );
        }
    }
}
