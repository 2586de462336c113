// SPDX-License-Identifier: Apache-2.0

//! Address-ordered device dispatch shared by the PIO and MMIO buses.
//!
//! A [`Bus`] owns no devices; it only knows the `[base, base+len)` interval
//! each one claims. Lookups are by-address and callbacks run with the bus's
//! internal lock released, so a callback may register or deregister a
//! sibling device on the same bus (PCI BAR activation does exactly this).

use std::ops::Bound::{Included, Unbounded};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A single byte-addressable I/O transfer.
///
/// `is_write` selects direction; `data` is the transfer buffer (its length
/// is the transfer size); `offset` is relative to the owning device's base.
pub trait Device: Send {
    fn handle_io(&mut self, data: &mut [u8], is_write: bool, offset: u64);
}

/// Shared handle to a device, stored by every bus it is registered on.
pub type DeviceHandle = Arc<Mutex<dyn Device>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("address range [{base:#x}, {end:#x}) overlaps an existing device")]
    AddressConflict { base: u64, end: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One registered interval, keyed by its base address for `BTreeMap` range
/// queries. `len` is kept alongside so a lookup can reject an access that
/// starts inside the interval but runs past its end.
struct Entry {
    len: u64,
    device: DeviceHandle,
}

/// Ordered set of non-overlapping [`Device`] intervals with O(log n) lookup.
///
/// `dev_num` is a monotonic counter the PCI bridge uses to assign bus/device
/// slot numbers; it is a property of the bus, not of any one device, because
/// slot assignment must survive individual devices being deregistered.
pub struct Bus {
    devices: BTreeMap<u64, Entry>,
    dev_num: u32,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            devices: BTreeMap::new(),
            dev_num: 0,
        }
    }

    /// Number of devices previously handed a slot via [`Bus::next_dev_num`].
    pub fn dev_num(&self) -> u32 {
        self.dev_num
    }

    /// Hand out the next monotonic device-slot number (PCI bus/dev/func
    /// assignment). Never decreases, even across deregistration.
    pub fn next_dev_num(&mut self) -> u32 {
        let n = self.dev_num;
        self.dev_num += 1;
        n
    }

    fn overlaps(&self, base: u64, len: u64) -> bool {
        let end = base + len;
        // Any entry whose base is < end could still overlap; walk backwards
        // from the first entry at or before `base` through the first one at
        // or after `end` is unnecessary here since we just need one hit.
        self.devices
            .range((Unbounded, Included(base)))
            .next_back()
            .map(|(&b, e)| b + e.len > base)
            .unwrap_or(false)
            || self
                .devices
                .range((Included(base), Unbounded))
                .next()
                .map(|(&b, _)| b < end)
                .unwrap_or(false)
    }

    /// Register `device` over `[base, base+len)`. Fails if the interval
    /// intersects any device already on this bus.
    pub fn register(&mut self, base: u64, len: u64, device: DeviceHandle) -> Result<()> {
        if self.overlaps(base, len) {
            return Err(Error::AddressConflict {
                base,
                end: base + len,
            });
        }
        self.devices.insert(base, Entry { len, device });
        Ok(())
    }

    /// Deregister whatever device is registered at exactly `base`. No-op if
    /// absent, so callers don't need to track registration state themselves.
    pub fn deregister(&mut self, base: u64) {
        self.devices.remove(&base);
    }

    /// Find the device whose interval contains `addr`, without holding the
    /// bus lock while the caller dispatches to it.
    fn lookup(&self, addr: u64) -> Option<(u64, DeviceHandle)> {
        self.devices
            .range((Unbounded, Included(addr)))
            .next_back()
            .filter(|(&base, e)| addr < base + e.len)
            .map(|(&base, e)| (base, e.device.clone()))
    }

    /// Dispatch one transfer at `addr`. If no device claims `addr`, the
    /// access is silently ignored: undefined guest behavior, never a host
    /// failure (spec §4.1, §7 `GuestUndefined`).
    pub fn handle_io(&self, data: &mut [u8], is_write: bool, addr: u64) {
        if let Some((base, device)) = self.lookup(addr) {
            // Bus lock (the one guarding `self.devices`, taken by the VMM
            // wrapper around `Bus`) is not held across this call: `lookup`
            // already returned an owned `Arc`, so the callback is free to
            // register/deregister siblings on the same bus.
            let offset = addr - base;
            device.lock().unwrap().handle_io(data, is_write, offset);
        } else {
            log::warn!("guest accessed unmapped address {:#x}", addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        last_offset: Option<u64>,
    }

    impl Device for Recorder {
        fn handle_io(&mut self, data: &mut [u8], _is_write: bool, offset: u64) {
            self.last_offset = Some(offset);
            for b in data.iter_mut() {
                *b = 0xAB;
            }
        }
    }

    fn recorder() -> (DeviceHandle, Arc<Mutex<Recorder>>) {
        let r = Arc::new(Mutex::new(Recorder { last_offset: None }));
        (r.clone() as DeviceHandle, r)
    }

    #[test]
    fn dispatches_to_device_with_correct_offset() {
        let mut bus = Bus::new();
        let (handle, inner) = recorder();
        bus.register(0x100, 64, handle).unwrap();

        let mut data = [0u8; 4];
        bus.handle_io(&mut data, false, 0x120);

        assert_eq!(inner.lock().unwrap().last_offset, Some(0x20));
        assert_eq!(data, [0xAB; 4]);
    }

    #[test]
    fn disjoint_registration_succeeds_overlapping_fails() {
        let mut bus = Bus::new();
        let (a, _) = recorder();
        bus.register(0x100, 0x30, a).unwrap();

        let (b, _) = recorder();
        assert!(bus.register(0x130, 0x10, b).is_ok());

        let (c, _) = recorder();
        assert!(matches!(
            bus.register(0x138, 0x18, c),
            Err(Error::AddressConflict { .. })
        ));
    }

    #[test]
    fn unmapped_address_is_silently_ignored() {
        let bus = Bus::new();
        let mut data = [0u8; 1];
        bus.handle_io(&mut data, true, 0xdead); // must not panic
    }

    #[test]
    fn deregister_from_within_callback_is_consistent() {
        struct SelfRemover {
            bus: Arc<Mutex<Bus>>,
            base: u64,
        }
        impl Device for SelfRemover {
            fn handle_io(&mut self, _data: &mut [u8], _is_write: bool, _offset: u64) {
                self.bus.lock().unwrap().deregister(self.base);
            }
        }

        let bus = Arc::new(Mutex::new(Bus::new()));
        let device = Arc::new(Mutex::new(SelfRemover {
            bus: bus.clone(),
            base: 0x200,
        })) as DeviceHandle;
        bus.lock().unwrap().register(0x200, 0x8, device).unwrap();

        let mut data = [0u8; 1];
        bus.lock().unwrap().handle_io(&mut data, true, 0x200);

        // Second dispatch to the now-deregistered range is ignored, not a panic.
        bus.lock().unwrap().handle_io(&mut data, true, 0x200);
    }

    #[test]
    fn dev_num_is_monotonic() {
        let mut bus = Bus::new();
        assert_eq!(bus.next_dev_num(), 0);
        assert_eq!(bus.next_dev_num(), 1);
        assert_eq!(bus.dev_num(), 2);
    }
}
