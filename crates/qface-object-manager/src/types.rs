//! Shared type aliases and wire-level constants for the Object Manager.

use std::collections::HashMap;

use zbus::zvariant::OwnedValue;

/// Interface's property name to its current value.
pub type PropertyMap = HashMap<String, OwnedValue>;

/// Interface name to its property map.
pub type InterfaceMap = HashMap<String, PropertyMap>;

/// Object path to the interfaces it exposes, as returned by
/// `GetManagedObjects` and carried in `InterfacesAdded`.
pub type ManagedObjects = HashMap<zbus::zvariant::OwnedObjectPath, InterfaceMap>;

/// Object path every Object Manager instance lives at.
pub const ROOT_PATH: &str = "/";

/// Interface name of the freedesktop Object Manager convention (rev 0.17).
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Interface name of the standard introspection method.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Name of the `InterfacesAdded` signal.
pub const INTERFACES_ADDED: &str = "InterfacesAdded";

/// Name of the `InterfacesRemoved` signal.
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";

/// Environment variable that overrides the default service-name pattern.
pub const SERVICE_NAME_PATTERN_ENV: &str = "DBUS_SERVICE_NAME_PATTERN";

/// Default regex used to recognize and claim object-manager-bearing services.
pub const DEFAULT_SERVICE_NAME_PATTERN: &str = "qface.service";
