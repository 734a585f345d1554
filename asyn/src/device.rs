//! A single addressable device on a multi-device port (`locateDevice`'s
//! `device` struct). Lives inside the owning port's `PortState`, never as a
//! separately locked object -- `port.rs` scans this list under the port's
//! own lock, exactly as `locateDevice` walks `deviceList` under `pport->lock`.

use crate::endpoint::EndpointState;

pub struct DeviceSlot {
    pub addr: i32,
    pub state: EndpointState,
}

impl DeviceSlot {
    fn new(addr: i32, auto_connect: bool) -> Self {
        Self {
            addr,
            state: EndpointState::new(auto_connect),
        }
    }
}

/// A port's devices, addressed by a linear scan -- ports rarely register
/// more than a handful, so this mirrors `locateDevice`'s `ellFirst`/`ellNext`
/// walk rather than reaching for a map.
#[derive(Default)]
pub struct DeviceList(Vec<DeviceSlot>);

impl DeviceList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn find(&self, addr: i32) -> Option<&DeviceSlot> {
        self.0.iter().find(|d| d.addr == addr)
    }

    pub fn find_mut(&mut self, addr: i32) -> Option<&mut DeviceSlot> {
        self.0.iter_mut().find(|d| d.addr == addr)
    }

    /// Find the device at `addr`, creating it (with `auto_connect`
    /// inherited from the port) if it doesn't exist yet.
    pub fn find_or_create(&mut self, addr: i32, auto_connect: bool) -> &mut DeviceSlot {
        if self.find(addr).is_none() {
            self.0.push(DeviceSlot::new(addr, auto_connect));
        }
        self.find_mut(addr).expect("just inserted")
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSlot> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceSlot> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
