//! The per-endpoint interface registry: `registerInterface`, `interposeInterface`,
//! and the `findInterface` lookup chain.
//!
//! A driver registers a vtable-like implementation of some named interface
//! (e.g. `"asynOctet"`) on a port; a filter or transport layer may later
//! interpose its own implementation in front of it, either for a single
//! device address or for the whole port. `findInterface` walks, in order,
//! the device's interpose list, the port's interpose list, and finally the
//! port's base interface list, returning the first match -- exactly
//! `locateInterfaceNode`'s three-call chain in `asynManager.c`.

use std::any::Any;
use std::sync::Arc;

/// A registered interface implementation, opaque to this crate.
///
/// The original stores a `const char *interfaceType` paired with a pointer
/// to a driver-supplied vtable struct and its private data. Rust has no
/// portable equivalent to a `void *` vtable pointer, so callers register a
/// `Arc<dyn Any + Send + Sync>` and downcast it back with
/// [`Interface::downcast`] using the same concrete type they registered.
#[derive(Clone)]
pub struct Interface {
    interface_type: &'static str,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Interface {
    pub fn new<T: Any + Send + Sync>(interface_type: &'static str, handle: Arc<T>) -> Self {
        Self {
            interface_type,
            handle,
        }
    }

    pub fn interface_type(&self) -> &'static str {
        self.interface_type
    }

    /// Recover the concrete type registered for this interface.
    ///
    /// Returns `None` if `T` doesn't match what was actually registered --
    /// a caller error, since `interfaceType` strings are the contract
    /// between the registrant and the requester.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("interface_type", &self.interface_type)
            .finish()
    }
}

/// An ordered, append-only list of registered interfaces, one per endpoint
/// (`interfaceList` on a port, `interposeInterfaceList` on a port or
/// device). Lookup is linear by `interfaceType`, matching
/// `locateInterfaceNode`'s `ellFirst`/`ellNext` scan -- these lists hold at
/// most a handful of entries so a `Vec` scan is simpler than a map and
/// preserves registration order for [`Self::all`].
#[derive(Default)]
pub struct InterfaceList(Vec<Interface>);

impl InterfaceList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn find(&self, interface_type: &str) -> Option<&Interface> {
        self.0.iter().find(|i| i.interface_type == interface_type)
    }

    /// Register `interface`, replacing any existing entry of the same
    /// `interfaceType` and returning it (the interposed-over implementation,
    /// for `interposeInterface`'s `ppPrev` out-parameter). `registerInterface`
    /// instead treats a pre-existing entry as an error; callers distinguish
    /// the two by checking the returned `Some` themselves.
    pub fn insert(&mut self, interface: Interface) -> Option<Interface> {
        if let Some(slot) = self
            .0
            .iter_mut()
            .find(|i| i.interface_type == interface.interface_type)
        {
            Some(std::mem::replace(slot, interface))
        } else {
            self.0.push(interface);
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.0.iter()
    }
}

/// Resolve `interfaceType` for a device address, following `findInterface`'s
/// device-interpose -> port-interpose -> port-base search order.
///
/// When `interpose_ok` is false, the interpose lists are skipped entirely and
/// only the port's base registration is considered, matching `findInterface`'s
/// `interposeInterfaceOK` parameter.
pub fn find_interface(
    device_interpose: Option<&InterfaceList>,
    port_interpose: &InterfaceList,
    port_base: &InterfaceList,
    interface_type: &str,
    interpose_ok: bool,
) -> Option<Interface> {
    if interpose_ok {
        if let Some(list) = device_interpose {
            if let Some(i) = list.find(interface_type) {
                return Some(i.clone());
            }
        }
        if let Some(i) = port_interpose.find(interface_type) {
            return Some(i.clone());
        }
    }
    port_base.find(interface_type).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_roundtrips() {
        let mut list = InterfaceList::new();
        assert!(list
            .insert(Interface::new("asynOctet", Arc::new(42u32)))
            .is_none());
        let found = list.find("asynOctet").unwrap();
        assert_eq!(*found.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let mut list = InterfaceList::new();
        list.insert(Interface::new("asynOctet", Arc::new(1u32)));
        let prev = list.insert(Interface::new("asynOctet", Arc::new(2u32)));
        assert_eq!(*prev.unwrap().downcast::<u32>().unwrap(), 1);
        assert_eq!(*list.find("asynOctet").unwrap().downcast::<u32>().unwrap(), 2);
    }

    #[test]
    fn find_interface_prefers_device_interpose_over_port() {
        let mut device_interpose = InterfaceList::new();
        device_interpose.insert(Interface::new("asynOctet", Arc::new("device")));
        let mut port_interpose = InterfaceList::new();
        port_interpose.insert(Interface::new("asynOctet", Arc::new("port-interpose")));
        let mut port_base = InterfaceList::new();
        port_base.insert(Interface::new("asynOctet", Arc::new("port-base")));

        let found = find_interface(
            Some(&device_interpose),
            &port_interpose,
            &port_base,
            "asynOctet",
            true,
        )
        .unwrap();
        assert_eq!(*found.downcast::<&str>().unwrap(), "device");
    }

    #[test]
    fn find_interface_skips_interpose_when_not_ok() {
        let mut device_interpose = InterfaceList::new();
        device_interpose.insert(Interface::new("asynOctet", Arc::new("device")));
        let mut port_base = InterfaceList::new();
        port_base.insert(Interface::new("asynOctet", Arc::new("port-base")));

        let found = find_interface(
            Some(&device_interpose),
            &InterfaceList::new(),
            &port_base,
            "asynOctet",
            false,
        )
        .unwrap();
        assert_eq!(*found.downcast::<&str>().unwrap(), "port-base");
    }

    #[test]
    fn find_interface_falls_back_to_port_base() {
        let device_interpose = InterfaceList::new();
        let port_interpose = InterfaceList::new();
        let mut port_base = InterfaceList::new();
        port_base.insert(Interface::new("asynOctet", Arc::new("port-base")));

        let found = find_interface(
            Some(&device_interpose),
            &port_interpose,
            &port_base,
            "asynOctet",
            true,
        )
        .unwrap();
        assert_eq!(*found.downcast::<&str>().unwrap(), "port-base");
    }
}
