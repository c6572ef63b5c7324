/// Object Manager errors.
///
/// Misuse that a generated adapter should never trigger at runtime (a
/// duplicate `register`, an `unregister` of a path that was never
/// registered, or a malformed object path) panics instead of returning one
/// of these variants — see the crate documentation for why.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// D-Bus communication error.
    #[error("dbus error: {0}")]
    Dbus(#[from] zbus::Error),

    /// `DBUS_SERVICE_NAME_PATTERN` is not a valid regular expression.
    #[error("invalid service name pattern {pattern:?}: {source}")]
    InvalidServiceNamePattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying parse error.
        #[source]
        source: regex::Error,
    },

    /// Claiming this connection's well-known identity failed.
    #[error("cannot claim well-known name {name:?}")]
    NameClaim {
        /// The name that could not be claimed.
        name: String,
        /// The underlying D-Bus error.
        #[source]
        source: zbus::Error,
    },

    /// `org.freedesktop.DBus.ListNames` failed during initialization.
    ///
    /// Fatal: the registry cannot discover existing peers without it.
    #[error("cannot enumerate bus names")]
    Enumeration(#[source] zbus::fdo::Error),

    /// A connection has no unique name yet (it hasn't completed the D-Bus
    /// `Hello` handshake), so it cannot be used as a singleton key.
    #[error("connection has no unique name")]
    NoUniqueName,
}
