//! Single-consumer demultiplexer for the signals that keep the remote object
//! map current: `InterfacesAdded`, `InterfacesRemoved` from every watched
//! peer, and `NameOwnerChanged` from the bus daemon itself.
//!
//! The demux decision table lives in [`apply`], a function that only
//! touches [`RegistryMaps`] — no connection, no I/O — so it can be
//! exercised with synthetic [`BusEvent`]s instead of a live bus. The task
//! spawned by [`spawn`] is a thin adapter: it turns `zbus::Message`s into
//! `BusEvent`s, calls `apply`, and performs the I/O (observer notification,
//! peer discovery) the pure function asked for.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};
use zbus::{
    fdo::DBusProxy,
    message::Type as MessageType,
    names::OwnedUniqueName,
    zvariant::OwnedObjectPath,
    Connection, MatchRule, MessageStream,
};

use crate::{
    registry::{RegistryMaps, RegistryState},
    types::{InterfaceMap, INTERFACES_ADDED, INTERFACES_REMOVED, OBJECT_MANAGER_INTERFACE},
};

/// One signal worth reacting to, already parsed out of a `zbus::Message`
/// (or synthesized directly in a test).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BusEvent {
    InterfacesAdded {
        peer: OwnedUniqueName,
        path: OwnedObjectPath,
        interfaces: InterfaceMap,
    },
    InterfacesRemoved {
        peer: OwnedUniqueName,
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
    NameOwnerChanged {
        name: String,
        old_owner: Option<OwnedUniqueName>,
        new_owner: Option<OwnedUniqueName>,
    },
}

/// What the live task must do in response to an event `apply` just folded
/// into the maps. Kept separate from the maps mutation itself so `apply`
/// stays synchronous and pure.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PumpEffects {
    pub(crate) notify_added: Vec<(OwnedUniqueName, OwnedObjectPath)>,
    pub(crate) notify_removed: Vec<(OwnedUniqueName, OwnedObjectPath)>,
    /// Set when a new peer matching the service pattern just appeared and
    /// needs an initial `GetManagedObjects` round trip.
    pub(crate) watch_peer: Option<OwnedUniqueName>,
    /// Set when a watched peer just dropped off the bus and needs its
    /// remote objects and match rules torn down.
    pub(crate) unwatch_peer: Option<OwnedUniqueName>,
}

/// Folds one [`BusEvent`] into `maps`, returning the notifications and
/// follow-up I/O the caller owes as a result.
///
/// `InterfacesAdded`/`InterfacesRemoved` from a sender that isn't currently
/// watched are dropped without touching the maps at all: a peer only
/// contributes to the remote view once its well-known name matched the
/// service pattern and it was handed to [`RegistryState::watch_service`],
/// matching the boundary rule that peers outside
/// `DBUS_SERVICE_NAME_PATTERN` never trigger callbacks.
///
/// `InterfacesRemoved` for a path tracked under a *different* peer than the
/// signal's sender is still reported to observers — the bus is the source
/// of truth for which connection sent the signal, and a stale or redundant
/// removal is harmless to report, whereas silently dropping it risks
/// leaving an observer's own bookkeeping stuck with a phantom entry — but
/// the remote map itself is left untouched, so the path stays attributed to
/// its real owner.
pub(crate) fn apply(
    maps: &mut RegistryMaps,
    pattern: &crate::config::ServiceNamePattern,
    event: BusEvent,
) -> PumpEffects {
    let mut effects = PumpEffects::default();

    match event {
        BusEvent::InterfacesAdded {
            peer,
            path,
            interfaces,
        } => {
            if !maps.watched.contains(&peer) {
                return effects;
            }
            if maps.insert_remote(path.clone(), peer.clone(), interfaces) {
                effects.notify_added.push((peer, path));
            } else {
                warn!(%path, %peer, "object path already owned by another peer, ignoring");
            }
        }
        BusEvent::InterfacesRemoved { peer, path, .. } => {
            if !maps.watched.contains(&peer) {
                return effects;
            }
            if !maps.remove_remote_if_owner(&path, &peer) {
                debug!(%path, %peer, "removal signal from a peer that doesn't own this path");
            }
            effects.notify_removed.push((peer, path));
        }
        BusEvent::NameOwnerChanged {
            name,
            old_owner,
            new_owner,
        } => {
            if !pattern.matches(&name) {
                return effects;
            }

            if let Some(owner) = old_owner {
                let removed_paths = maps.remove_remote_owned_by(&owner);
                effects
                    .notify_removed
                    .extend(removed_paths.into_iter().map(|path| (owner.clone(), path)));
                effects.unwatch_peer = Some(owner);
            }

            if let Some(owner) = new_owner {
                effects.watch_peer = Some(owner);
            }
        }
    }

    effects
}

/// Spawns the long-running task that feeds real bus traffic into [`apply`]
/// for the lifetime of `state`'s connection.
///
/// Runs until the connection is dropped and its message streams end; there
/// is no separate cancellation token because the registry's own lifetime
/// already tracks the connection's.
pub(crate) fn spawn(state: Arc<RegistryState>) {
    tokio::spawn(async move {
        if let Err(error) = run(state).await {
            warn!(%error, "object manager signal pump exited");
        }
    });
}

/// Adds sender-scoped match rules for `peer`'s `InterfacesAdded`/
/// `InterfacesRemoved` signals, mirroring the original's
/// `AddMatchSignal(..., WithMatchSender(serviceOwner))` calls. The pump's
/// own streams (built without a sender restriction) already receive
/// whatever the daemon delivers; registering these rules is what makes the
/// daemon deliver `peer`'s signals to this connection in the first place.
pub(crate) async fn add_peer_match_rules(
    connection: &Connection,
    peer: &OwnedUniqueName,
) -> zbus::Result<()> {
    let dbus_proxy = DBusProxy::new(connection).await?;
    dbus_proxy
        .add_match_rule(peer_match_rule(peer, INTERFACES_ADDED)?)
        .await?;
    dbus_proxy
        .add_match_rule(peer_match_rule(peer, INTERFACES_REMOVED)?)
        .await?;
    Ok(())
}

/// Removes the match rules [`add_peer_match_rules`] registered for `peer`.
pub(crate) async fn remove_peer_match_rules(
    connection: &Connection,
    peer: &OwnedUniqueName,
) -> zbus::Result<()> {
    let dbus_proxy = DBusProxy::new(connection).await?;
    dbus_proxy
        .remove_match_rule(peer_match_rule(peer, INTERFACES_ADDED)?)
        .await?;
    dbus_proxy
        .remove_match_rule(peer_match_rule(peer, INTERFACES_REMOVED)?)
        .await?;
    Ok(())
}

fn peer_match_rule(
    peer: &OwnedUniqueName,
    member: &'static str,
) -> zbus::Result<MatchRule<'static>> {
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(peer.clone())?
        .interface(OBJECT_MANAGER_INTERFACE)?
        .member(member)?
        .build();
    Ok(rule)
}

async fn run(state: Arc<RegistryState>) -> zbus::Result<()> {
    let connection = state.connection.clone();

    let added_rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .interface(OBJECT_MANAGER_INTERFACE)?
        .member(INTERFACES_ADDED)?
        .build();
    let removed_rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .interface(OBJECT_MANAGER_INTERFACE)?
        .member(INTERFACES_REMOVED)?
        .build();

    let mut added_stream = MessageStream::for_match_rule(added_rule, &connection, None).await?;
    let mut removed_stream =
        MessageStream::for_match_rule(removed_rule, &connection, None).await?;

    let dbus_proxy = DBusProxy::new(&connection).await?;
    let mut name_owner_changed = dbus_proxy.receive_name_owner_changed().await?;

    loop {
        let event = tokio::select! {
            Some(msg) = added_stream.next() => {
                match parse_interfaces_added(msg?) {
                    Some(event) => event,
                    None => continue,
                }
            }
            Some(msg) = removed_stream.next() => {
                match parse_interfaces_removed(msg?) {
                    Some(event) => event,
                    None => continue,
                }
            }
            Some(signal) = name_owner_changed.next() => {
                let Ok(args) = signal.args() else { continue };
                BusEvent::NameOwnerChanged {
                    name: args.name.to_string(),
                    old_owner: args.old_owner.map(|owner| owner.to_owned().into()),
                    new_owner: args.new_owner.map(|owner| owner.to_owned().into()),
                }
            }
            else => return Ok(()),
        };

        let effects = {
            #[allow(clippy::expect_used)]
            let mut maps = state.core.maps.lock().expect("registry maps poisoned");
            apply(&mut maps, &state.pattern, event)
        };

        for (peer, path) in effects.notify_added {
            state.core.notify_added(&peer, &path);
        }
        for (peer, path) in effects.notify_removed {
            state.core.notify_removed(&peer, &path);
        }
        if let Some(peer) = effects.watch_peer {
            debug!(%peer, "watching newly-owned service name");
            state.watch_service(peer).await;
        }
        if let Some(peer) = effects.unwatch_peer {
            debug!(%peer, "service name lost its owner");
            state.remove_service(peer).await;
        }
    }
}

fn parse_interfaces_added(msg: zbus::Message) -> Option<BusEvent> {
    let peer = msg.header().sender()?.to_owned().into();
    let (path, interfaces) = msg
        .body()
        .deserialize::<(OwnedObjectPath, InterfaceMap)>()
        .ok()?;
    Some(BusEvent::InterfacesAdded {
        peer,
        path,
        interfaces,
    })
}

fn parse_interfaces_removed(msg: zbus::Message) -> Option<BusEvent> {
    let peer = msg.header().sender()?.to_owned().into();
    let (path, interfaces) = msg
        .body()
        .deserialize::<(OwnedObjectPath, Vec<String>)>()
        .ok()?;
    Some(BusEvent::InterfacesRemoved {
        peer,
        path,
        interfaces,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::ServiceNamePattern;

    fn pattern() -> ServiceNamePattern {
        ServiceNamePattern::new("qface.service").unwrap()
    }

    fn peer(value: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(value).unwrap()
    }

    fn path(value: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(value).unwrap()
    }

    mod apply {
        use super::*;

        #[test]
        fn interfaces_added_inserts_into_remote_map_and_notifies() {
            let mut maps = RegistryMaps::default();
            maps.watched.insert(peer(":1.5"));
            let event = BusEvent::InterfacesAdded {
                peer: peer(":1.5"),
                path: path("/svc/a"),
                interfaces: InterfaceMap::from([("com.example.Foo".to_string(), HashMap::new())]),
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects.notify_added, vec![(peer(":1.5"), path("/svc/a"))]);
            assert!(maps.remote.contains_key(&path("/svc/a")));
        }

        #[test]
        fn interfaces_added_from_unwatched_peer_is_ignored() {
            let mut maps = RegistryMaps::default();
            let event = BusEvent::InterfacesAdded {
                peer: peer(":1.99"),
                path: path("/svc/a"),
                interfaces: InterfaceMap::new(),
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects, PumpEffects::default());
            assert!(maps.remote.is_empty());
        }

        #[test]
        fn interfaces_added_from_conflicting_peer_keeps_prior_owner() {
            let mut maps = RegistryMaps::default();
            maps.watched.insert(peer(":1.5"));
            maps.watched.insert(peer(":1.6"));
            maps.insert_remote(path("/svc/a"), peer(":1.5"), InterfaceMap::new());

            let effects = apply(
                &mut maps,
                &pattern(),
                BusEvent::InterfacesAdded {
                    peer: peer(":1.6"),
                    path: path("/svc/a"),
                    interfaces: InterfaceMap::new(),
                },
            );

            assert!(effects.notify_added.is_empty());
            assert_eq!(maps.remote[&path("/svc/a")].owner, peer(":1.5"));
        }

        #[test]
        fn interfaces_removed_notifies_even_for_untracked_owner() {
            let mut maps = RegistryMaps::default();
            maps.watched.insert(peer(":1.9"));
            let event = BusEvent::InterfacesRemoved {
                peer: peer(":1.9"),
                path: path("/svc/a"),
                interfaces: vec!["com.example.Foo".to_string()],
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects.notify_removed, vec![(peer(":1.9"), path("/svc/a"))]);
        }

        #[test]
        fn interfaces_removed_from_unwatched_peer_is_ignored() {
            let mut maps = RegistryMaps::default();
            let event = BusEvent::InterfacesRemoved {
                peer: peer(":1.9"),
                path: path("/svc/a"),
                interfaces: vec!["com.example.Foo".to_string()],
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects, PumpEffects::default());
        }

        #[test]
        fn name_owner_changed_ignores_names_outside_the_pattern() {
            let mut maps = RegistryMaps::default();
            let event = BusEvent::NameOwnerChanged {
                name: "org.freedesktop.Notifications".to_string(),
                old_owner: None,
                new_owner: Some(peer(":1.3")),
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects, PumpEffects::default());
        }

        #[test]
        fn name_owner_changed_with_new_owner_asks_caller_to_watch_it() {
            let mut maps = RegistryMaps::default();
            let event = BusEvent::NameOwnerChanged {
                name: "qface.service.Example".to_string(),
                old_owner: None,
                new_owner: Some(peer(":1.4")),
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects.watch_peer, Some(peer(":1.4")));
        }

        #[test]
        fn name_owner_changed_with_lost_owner_notifies_removal_for_every_owned_object() {
            let mut maps = RegistryMaps::default();
            maps.watched.insert(peer(":1.4"));
            maps.insert_remote(path("/svc/a"), peer(":1.4"), HashMap::new());
            maps.insert_remote(path("/svc/b"), peer(":1.4"), HashMap::new());
            let event = BusEvent::NameOwnerChanged {
                name: "qface.service.Example".to_string(),
                old_owner: Some(peer(":1.4")),
                new_owner: None,
            };

            let effects = apply(&mut maps, &pattern(), event);

            assert_eq!(effects.notify_removed.len(), 2);
            assert_eq!(effects.unwatch_peer, Some(peer(":1.4")));
            assert!(maps.remote.is_empty());
        }
    }
}
