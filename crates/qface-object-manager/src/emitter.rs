//! The seam between registry mutation and signal emission.
//!
//! Production code emits `InterfacesAdded`/`InterfacesRemoved` straight onto
//! a live [`zbus::Connection`], the same way
//! `wayle-systray`'s watcher emits `StatusNotifierItemUnregistered`: not
//! through the `#[zbus::interface]` macro's generated signal method, but via
//! `Connection::emit_signal` directly, since the root Object Manager
//! interface is implemented by hand (see `introspection.rs`).

use zbus::{zvariant::OwnedObjectPath, Connection};

use crate::types::{InterfaceMap, INTERFACES_ADDED, INTERFACES_REMOVED, OBJECT_MANAGER_INTERFACE, ROOT_PATH};

/// Emits the two Object Manager lifecycle signals.
///
/// Exists so registry logic can be unit-tested against an in-memory
/// recorder instead of a live bus connection.
#[allow(async_fn_in_trait)]
pub trait ManagedObjectsEmitter: Send + Sync {
    /// Emits `InterfacesAdded(path, interfaces)`.
    async fn emit_interfaces_added(
        &self,
        path: &OwnedObjectPath,
        interfaces: &InterfaceMap,
    ) -> zbus::Result<()>;

    /// Emits `InterfacesRemoved(path, interface_names)`.
    async fn emit_interfaces_removed(
        &self,
        path: &OwnedObjectPath,
        interfaces: &[String],
    ) -> zbus::Result<()>;
}

impl ManagedObjectsEmitter for Connection {
    async fn emit_interfaces_added(
        &self,
        path: &OwnedObjectPath,
        interfaces: &InterfaceMap,
    ) -> zbus::Result<()> {
        self.emit_signal(
            None::<()>,
            ROOT_PATH,
            OBJECT_MANAGER_INTERFACE,
            INTERFACES_ADDED,
            &(path, interfaces),
        )
        .await
    }

    async fn emit_interfaces_removed(
        &self,
        path: &OwnedObjectPath,
        interfaces: &[String],
    ) -> zbus::Result<()> {
        self.emit_signal(
            None::<()>,
            ROOT_PATH,
            OBJECT_MANAGER_INTERFACE,
            INTERFACES_REMOVED,
            &(path, interfaces),
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Records emitted signals instead of sending them, for registry tests.
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub(crate) added: Mutex<Vec<(OwnedObjectPath, Vec<String>)>>,
        pub(crate) removed: Mutex<Vec<(OwnedObjectPath, Vec<String>)>>,
    }

    impl ManagedObjectsEmitter for RecordingEmitter {
        async fn emit_interfaces_added(
            &self,
            path: &OwnedObjectPath,
            interfaces: &InterfaceMap,
        ) -> zbus::Result<()> {
            self.added
                .lock()
                .unwrap()
                .push((path.clone(), interfaces.keys().cloned().collect()));
            Ok(())
        }

        async fn emit_interfaces_removed(
            &self,
            path: &OwnedObjectPath,
            interfaces: &[String],
        ) -> zbus::Result<()> {
            self.removed
                .lock()
                .unwrap()
                .push((path.clone(), interfaces.to_vec()));
            Ok(())
        }
    }
}
