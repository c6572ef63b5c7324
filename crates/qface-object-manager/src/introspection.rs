//! The two interfaces this crate exports at the root path: the standard
//! Object Manager (`GetManagedObjects`) and a hand-written Introspectable
//! (`Introspect`).
//!
//! `zbus`'s own `#[interface]` macro generates introspection for the
//! methods and properties declared in the block it's attached to, but it
//! has no way to know about the virtual top-level node names this crate
//! synthesizes from the managed object paths — so `Introspect` is
//! implemented by hand instead of relying on the macro's output.

use std::{collections::BTreeSet, sync::Arc};

use tracing::instrument;
use zbus::interface;

use crate::{registry::RegistryState, types::ManagedObjects};

/// Exports `org.freedesktop.DBus.ObjectManager` at the root path.
#[derive(Debug)]
pub(crate) struct ObjectManagerInterface {
    pub(crate) state: Arc<RegistryState>,
}

#[interface(name = "org.freedesktop.DBus.ObjectManager")]
impl ObjectManagerInterface {
    /// Every object this connection currently knows about: its own exports
    /// merged with every watched peer's.
    #[instrument(skip(self))]
    async fn get_managed_objects(&self) -> ManagedObjects {
        self.state.managed_objects()
    }
}

/// Exports `org.freedesktop.DBus.Introspectable` at the root path.
#[derive(Debug)]
pub(crate) struct IntrospectableInterface {
    pub(crate) state: Arc<RegistryState>,
}

#[interface(name = "org.freedesktop.DBus.Introspectable")]
impl IntrospectableInterface {
    #[instrument(skip(self))]
    async fn introspect(&self) -> String {
        render_introspection_xml(&self.state.local_top_level_segments())
    }
}

/// Builds the `Introspect` reply by hand: the two interfaces this crate
/// implements, plus one `<node>` child per top-level path segment seen
/// among objects this connection exports itself, so tools like `busctl
/// tree` can walk into the hierarchy. Remote objects watched from other
/// peers never contribute a node here — walking into one would 404, since
/// they aren't hosted by this connection's object server, mirroring the
/// original's `objectNodes`, which is likewise only ever populated from
/// `RegisterObject`.
fn render_introspection_xml(local_segments: &[String]) -> String {
    let children: BTreeSet<&str> = local_segments.iter().map(String::as_str).collect();

    let mut xml = String::from(
        "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
         \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n\
         <node>\n",
    );

    xml.push_str(
        "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n\
         \x20   <method name=\"Introspect\">\n\
         \x20     <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n\
         \x20   </method>\n\
         \x20 </interface>\n",
    );

    xml.push_str(
        "  <interface name=\"org.freedesktop.DBus.ObjectManager\">\n\
         \x20   <method name=\"GetManagedObjects\">\n\
         \x20     <arg name=\"objpath_interfaces_and_properties\" type=\"a{oa{sa{sv}}}\" direction=\"out\"/>\n\
         \x20   </method>\n\
         \x20   <signal name=\"InterfacesAdded\">\n\
         \x20     <arg name=\"object_path\" type=\"o\"/>\n\
         \x20     <arg name=\"interfaces_and_properties\" type=\"a{sa{sv}}\"/>\n\
         \x20   </signal>\n\
         \x20   <signal name=\"InterfacesRemoved\">\n\
         \x20     <arg name=\"object_path\" type=\"o\"/>\n\
         \x20     <arg name=\"interfaces\" type=\"as\"/>\n\
         \x20   </signal>\n\
         \x20 </interface>\n",
    );

    for child in children {
        xml.push_str(&format!("  <node name=\"{child}\"/>\n"));
    }

    xml.push_str("</node>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    mod render_introspection_xml {
        use super::*;

        #[test]
        fn lists_one_node_per_distinct_top_level_segment() {
            let segments = [
                "org".to_string(),
                "org".to_string(),
                "svc".to_string(),
            ];

            let xml = render_introspection_xml(&segments);

            assert_eq!(xml.matches("<node name=\"org\"/>").count(), 1);
            assert!(xml.contains("<node name=\"svc\"/>"));
        }

        #[test]
        fn always_declares_both_interfaces() {
            let xml = render_introspection_xml(&[]);

            assert!(xml.contains("org.freedesktop.DBus.ObjectManager"));
            assert!(xml.contains("org.freedesktop.DBus.Introspectable"));
        }
    }
}
