// SPDX-License-Identifier: Apache-2.0

//! Per-device PCI config-space header and BAR lifecycle (spec §4.3).
//! Grounded on `pci_config_write`/`pci_config_read`, `pci_set_bar`,
//! `pci_activate_bar`/`pci_deactivate_bar` and `pci_command_bar` from the
//! original C `kvm-host` project's `pci.c`.

use std::sync::{Arc, Mutex};

use super::super::bus::{Bus, DeviceHandle};

const PCI_CFG_SPACE_SIZE: usize = 256;
const PCI_VENDOR_ID: usize = 0x00;
const PCI_DEVICE_ID: usize = 0x02;
const PCI_COMMAND: usize = 0x04;
const PCI_CLASS_REVISION: usize = 0x08;
const PCI_HEADER_TYPE: usize = 0x0e;
const PCI_BASE_ADDRESS_0: usize = 0x10;
const PCI_ROM_ADDRESS: usize = 0x30;

const PCI_COMMAND_IO: u16 = 0x1;
const PCI_COMMAND_MEMORY: u16 = 0x2;

const NUM_BARS: usize = 6;

fn read_u32(cfg: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(cfg[offset..offset + 4].try_into().unwrap())
}

fn write_u32(cfg: &mut [u8], offset: usize, value: u32) {
    cfg[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Bookkeeping for one Base Address Register. `base` is the decode address
/// actually used for bus registration: the BAR's type-indicator bit (stored
/// in the register value returned to the guest) is stripped out of it, since
/// it is metadata about the register, not part of the address a transaction
/// decodes against.
#[derive(Default)]
struct Bar {
    size: u32,
    is_io_space: bool,
    active: bool,
    base: u32,
    handler: Option<DeviceHandle>,
}

/// One PCI function's 256-byte config-space header plus its BAR/bus
/// bookkeeping. Registered on the host bridge's internal `pci_bus` behind a
/// `ConfigDevice` shim; BARs are registered on the VMM's shared `io_bus` /
/// `mmio_bus` as the guest enables them via the COMMAND register.
pub struct PciDevice {
    cfg_space: [u8; PCI_CFG_SPACE_SIZE],
    bars: [Bar; NUM_BARS],
    io_bus: Arc<Mutex<Bus>>,
    mmio_bus: Arc<Mutex<Bus>>,
}

impl PciDevice {
    pub fn new(
        io_bus: &Arc<Mutex<Bus>>,
        mmio_bus: &Arc<Mutex<Bus>>,
        vendor_id: u16,
        device_id: u16,
    ) -> Self {
        let mut cfg_space = [0u8; PCI_CFG_SPACE_SIZE];
        write_u32(&mut cfg_space, PCI_VENDOR_ID, vendor_id as u32);
        cfg_space[PCI_DEVICE_ID..PCI_DEVICE_ID + 2].copy_from_slice(&device_id.to_le_bytes());
        cfg_space[PCI_HEADER_TYPE] = 0x00;
        // class/subclass left at 0 (unclassified) for the caller to set via
        // `set_class` if it cares; most of our guests only probe vendor/device.
        let _ = PCI_CLASS_REVISION;

        PciDevice {
            cfg_space,
            bars: Default::default(),
            io_bus: io_bus.clone(),
            mmio_bus: mmio_bus.clone(),
        }
    }

    /// Sets the class/subclass/prog-if/revision dword at offset 0x08.
    pub fn set_class(&mut self, class: u8, subclass: u8, prog_if: u8, revision: u8) {
        write_u32(
            &mut self.cfg_space,
            PCI_CLASS_REVISION,
            u32::from_le_bytes([revision, prog_if, subclass, class]),
        );
    }

    /// Declares BAR `bar` as `size` bytes (must be a power of two) of I/O or
    /// memory space, backed by `handler` once the guest activates it through
    /// the COMMAND register. Mirrors `pci_set_bar`.
    pub fn set_bar(&mut self, bar: usize, size: u32, is_io_space: bool, handler: DeviceHandle) {
        assert!(size.is_power_of_two());
        let tag = is_io_space as u32;
        write_u32(&mut self.cfg_space, PCI_BASE_ADDRESS_0 + bar * 4, tag);
        self.bars[bar] = Bar {
            size,
            is_io_space,
            active: false,
            base: 0,
            handler: Some(handler),
        };
    }

    pub fn read_config(&self, offset: usize, data: &mut [u8]) {
        let end = (offset + data.len()).min(PCI_CFG_SPACE_SIZE);
        if offset >= PCI_CFG_SPACE_SIZE {
            data.fill(0xff);
            return;
        }
        let n = end - offset;
        data[..n].copy_from_slice(&self.cfg_space[offset..end]);
        data[n..].fill(0xff);
    }

    /// Copies `data` into the header at `offset`, then applies whatever
    /// side effect that register carries (spec §4.3).
    pub fn write_config(&mut self, offset: usize, data: &[u8]) {
        if offset >= PCI_CFG_SPACE_SIZE {
            return;
        }
        let end = (offset + data.len()).min(PCI_CFG_SPACE_SIZE);
        let n = end - offset;
        self.cfg_space[offset..end].copy_from_slice(&data[..n]);

        if offset == PCI_COMMAND {
            self.command_updated();
        } else if offset == PCI_ROM_ADDRESS {
            write_u32(&mut self.cfg_space, PCI_ROM_ADDRESS, 0);
        } else if (PCI_BASE_ADDRESS_0..PCI_BASE_ADDRESS_0 + NUM_BARS * 4).contains(&offset) {
            let bar = (offset - PCI_BASE_ADDRESS_0) / 4;
            self.bar_written(bar);
        }
    }

    fn command_updated(&mut self) {
        let command = u16::from_le_bytes(
            self.cfg_space[PCI_COMMAND..PCI_COMMAND + 2]
                .try_into()
                .unwrap(),
        );
        let io_enabled = command & PCI_COMMAND_IO != 0;
        let mem_enabled = command & PCI_COMMAND_MEMORY != 0;

        for i in 0..NUM_BARS {
            if self.bars[i].size == 0 {
                continue;
            }
            let enable = if self.bars[i].is_io_space {
                io_enabled
            } else {
                mem_enabled
            };
            if enable {
                self.activate_bar(i);
            } else {
                self.deactivate_bar(i);
            }
        }
    }

    fn bar_written(&mut self, bar: usize) {
        let offset = PCI_BASE_ADDRESS_0 + bar * 4;
        let size = self.bars[bar].size;
        if size == 0 {
            return;
        }
        let mask = !(size - 1);
        let raw = read_u32(&self.cfg_space, offset);
        let tag = self.bars[bar].is_io_space as u32;
        let new = (raw & mask) | tag;
        write_u32(&mut self.cfg_space, offset, new);
        self.bars[bar].base = new & mask;
    }

    /// Registers the BAR's handler on its target bus, if it isn't already
    /// active and its base is nonzero. `active` is unconditionally set, even
    /// when the base isn't decodable yet, matching `pci_activate_bar`.
    fn activate_bar(&mut self, i: usize) {
        let bar = &self.bars[i];
        if !bar.active && bar.base != 0 {
            if let Some(handler) = bar.handler.clone() {
                let bus = if bar.is_io_space {
                    &self.io_bus
                } else {
                    &self.mmio_bus
                };
                if let Err(e) = bus
                    .lock()
                    .unwrap()
                    .register(bar.base as u64, bar.size as u64, handler)
                {
                    log::warn!("BAR{i} activation failed: {e}");
                }
            }
        }
        self.bars[i].active = true;
    }

    fn deactivate_bar(&mut self, i: usize) {
        let bar = &self.bars[i];
        if bar.active && bar.base != 0 {
            let bus = if bar.is_io_space {
                &self.io_bus
            } else {
                &self.mmio_bus
            };
            bus.lock().unwrap().deregister(bar.base as u64);
        }
        self.bars[i].active = false;
    }
}

/// A BAR's programmed decode base, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciBar {
    pub base: u32,
    pub size: u32,
    pub active: bool,
}

impl PciDevice {
    pub fn bar(&self, i: usize) -> PciBar {
        let b = &self.bars[i];
        PciBar {
            base: b.base,
            size: b.size,
            active: b.active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::bus::Device;

    struct Dummy;
    impl Device for Dummy {
        fn handle_io(&mut self, _data: &mut [u8], _is_write: bool, _offset: u64) {}
    }

    fn handle() -> DeviceHandle {
        Arc::new(Mutex::new(Dummy))
    }

    #[test]
    fn bar_probe_and_program_round_trip() {
        let io_bus = Arc::new(Mutex::new(Bus::new()));
        let mmio_bus = Arc::new(Mutex::new(Bus::new()));
        let mut dev = PciDevice::new(&io_bus, &mmio_bus, 0x1af4, 0x1001);
        dev.set_bar(0, 0x100, true, handle());

        // Guest probes the BAR with all-ones, size is revealed by the mask.
        dev.write_config(PCI_BASE_ADDRESS_0, &0xffff_ffffu32.to_le_bytes());
        let mut readback = [0u8; 4];
        dev.read_config(PCI_BASE_ADDRESS_0, &mut readback);
        assert_eq!(u32::from_le_bytes(readback), 0xffff_ff01);

        // Guest programs a real base.
        dev.write_config(PCI_BASE_ADDRESS_0, &0x0000_1001u32.to_le_bytes());
        dev.read_config(PCI_BASE_ADDRESS_0, &mut readback);
        assert_eq!(u32::from_le_bytes(readback), 0x0000_1001);
        assert_eq!(dev.bar(0).base, 0x1000);
    }

    #[test]
    fn enabling_command_io_registers_bar_on_io_bus() {
        let io_bus = Arc::new(Mutex::new(Bus::new()));
        let mmio_bus = Arc::new(Mutex::new(Bus::new()));
        let mut dev = PciDevice::new(&io_bus, &mmio_bus, 0x1af4, 0x1001);
        dev.set_bar(0, 0x100, true, handle());
        dev.write_config(PCI_BASE_ADDRESS_0, &0x0000_1001u32.to_le_bytes());

        dev.write_config(PCI_COMMAND, &PCI_COMMAND_IO.to_le_bytes());
        assert!(dev.bar(0).active);

        let mut data = [0u8; 1];
        io_bus.lock().unwrap().handle_io(&mut data, false, 0x1000);
        // No panic means the address dispatched to our BAR's handler.
    }

    #[test]
    fn disabling_command_deregisters_bar() {
        let io_bus = Arc::new(Mutex::new(Bus::new()));
        let mmio_bus = Arc::new(Mutex::new(Bus::new()));
        let mut dev = PciDevice::new(&io_bus, &mmio_bus, 0x1af4, 0x1001);
        dev.set_bar(0, 0x100, true, handle());
        dev.write_config(PCI_BASE_ADDRESS_0, &0x0000_1001u32.to_le_bytes());
        dev.write_config(PCI_COMMAND, &PCI_COMMAND_IO.to_le_bytes());
        dev.write_config(PCI_COMMAND, &0u16.to_le_bytes());

        assert!(!dev.bar(0).active);
        // A second device can now claim the same range.
        io_bus
            .lock()
            .unwrap()
            .register(0x1000, 0x100, handle())
            .unwrap();
    }

    #[test]
    fn rom_address_writes_are_discarded() {
        let io_bus = Arc::new(Mutex::new(Bus::new()));
        let mmio_bus = Arc::new(Mutex::new(Bus::new()));
        let mut dev = PciDevice::new(&io_bus, &mmio_bus, 0x1af4, 0x1001);
        dev.write_config(PCI_ROM_ADDRESS, &0xffff_fffeu32.to_le_bytes());
        let mut readback = [0u8; 4];
        dev.read_config(PCI_ROM_ADDRESS, &mut readback);
        assert_eq!(u32::from_le_bytes(readback), 0);
    }
}
