//! A per-connection D-Bus Object Manager.
//!
//! Generated adapters register the objects they export with [`RegistryState`]
//! and the registry takes care of the rest: emitting
//! `org.freedesktop.DBus.ObjectManager`'s `InterfacesAdded`/
//! `InterfacesRemoved` signals, answering `GetManagedObjects` and
//! `Introspect` at the root path, and watching every other bus name that
//! matches this process's service-name pattern so remote objects show up in
//! the same merged view as local ones.
//!
//! ```no_run
//! # async fn example() -> Result<(), qface_object_manager::Error> {
//! let connection = zbus::Connection::session().await?;
//! let registry = qface_object_manager::registry(&connection).await?;
//! # let _ = registry;
//! # Ok(())
//! # }
//! ```
//!
//! # Error handling
//!
//! Conditions a generated adapter can trigger only by misusing this crate —
//! registering the same path twice, unregistering a path that was never
//! registered — panic instead of returning a [`Error`]. [`Error`] is
//! reserved for conditions that depend on the state of the bus, not on the
//! caller's own bookkeeping: a name already owned by someone else, a
//! connection that hasn't completed its `Hello` handshake, an unparsable
//! `DBUS_SERVICE_NAME_PATTERN`.

mod config;
mod emitter;
mod error;
mod introspection;
mod observer;
mod registry;
mod signal_pump;
mod types;

pub use config::ServiceNamePattern;
pub use emitter::ManagedObjectsEmitter;
pub use error::Error;
pub use observer::{InterfacesAddedObserver, InterfacesRemovedObserver};
pub use registry::{registry, RegistryState};
pub use types::{
    InterfaceMap, ManagedObjects, PropertyMap, DEFAULT_SERVICE_NAME_PATTERN,
    INTERFACES_ADDED, INTERFACES_REMOVED, INTROSPECTABLE_INTERFACE, OBJECT_MANAGER_INTERFACE,
    ROOT_PATH, SERVICE_NAME_PATTERN_ENV,
};
