// SPDX-License-Identifier: Apache-2.0

//! Legacy virtio-pci transport registers for a block device (VIRTIO 1.0
//! §4.1.4.8 legacy interface). Only the PCI/BAR/interrupt plumbing is in
//! scope here: feature negotiation, queue address/size/select bookkeeping,
//! status and ISR handling, and a capacity field read from the backing
//! file's length. Virtqueue descriptor-chain walking and disk-image I/O
//! are an explicit Non-goal, so `QUEUE_NOTIFY` is acknowledged but never
//! dispatches any actual request.

use std::fs::File;
use std::sync::{Arc, Mutex};

use super::bus::Device;
use super::serial::IrqLine;

const VIRTIO_BLK_DEVICE_ID: u32 = 2;
const SECTOR_SIZE: u64 = 512;

const REG_DEVICE_FEATURES: u64 = 0x00;
const REG_GUEST_FEATURES: u64 = 0x04;
const REG_QUEUE_ADDRESS: u64 = 0x08;
const REG_QUEUE_SIZE: u64 = 0x0c;
const REG_QUEUE_SELECT: u64 = 0x0e;
const REG_QUEUE_NOTIFY: u64 = 0x10;
const REG_DEVICE_STATUS: u64 = 0x12;
const REG_ISR_STATUS: u64 = 0x13;
const REG_CONFIG: u64 = 0x14;

/// Only queue 0 (the single request queue virtio-blk exposes) reports a
/// nonzero size; any other `queue_select` tells the driver there's nothing
/// there.
const QUEUE_SIZE: u16 = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open backing file: {0}")]
    OpenBackingFile(std::io::Error),
    #[error("backing file I/O error: {0}")]
    BackingFileIo(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Inner {
    device_features: u32,
    guest_features: u32,
    status: u8,
    isr: u8,
    queue_select: u16,
    queue_address: u32,
    capacity_sectors: u64,
    // Kept open so `capacity_sectors` reflects a live file, but never read
    // from or written to: descriptor-chain walking and disk I/O are out of
    // scope here.
    _backing: File,
}

/// A legacy virtio-pci block device transport, registered as BAR0 (I/O
/// space) behind a [`super::pci::PciDevice`]. Exposes the register window a
/// guest driver probes and configures a virtqueue through; never services
/// one.
pub struct VirtioBlk {
    inner: Mutex<Inner>,
    irq: Arc<dyn IrqLine>,
}

impl VirtioBlk {
    pub fn new(path: &std::path::Path, irq: Arc<dyn IrqLine>) -> Result<Self> {
        let backing = File::open(path).map_err(Error::OpenBackingFile)?;
        let len = backing.metadata().map_err(Error::BackingFileIo)?.len();

        Ok(VirtioBlk {
            inner: Mutex::new(Inner {
                device_features: 0,
                guest_features: 0,
                status: 0,
                isr: 0,
                queue_select: 0,
                queue_address: 0,
                capacity_sectors: len / SECTOR_SIZE,
                _backing: backing,
            }),
            irq,
        })
    }

    pub const DEVICE_ID: u32 = VIRTIO_BLK_DEVICE_ID;
}

impl Device for VirtioBlk {
    fn handle_io(&mut self, data: &mut [u8], is_write: bool, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if is_write {
            match offset {
                REG_GUEST_FEATURES if data.len() == 4 => {
                    inner.guest_features = u32::from_le_bytes(data.try_into().unwrap());
                }
                REG_QUEUE_ADDRESS if data.len() == 4 => {
                    inner.queue_address = u32::from_le_bytes(data.try_into().unwrap());
                }
                REG_QUEUE_SELECT if data.len() == 2 => {
                    inner.queue_select = u16::from_le_bytes(data.try_into().unwrap());
                }
                REG_QUEUE_NOTIFY if data.len() == 2 => {
                    // Descriptor-chain processing is out of scope; just
                    // acknowledge the kick so the driver doesn't stall on
                    // the register write itself.
                    log::debug!("virtio-blk: queue notify (processing not implemented)");
                }
                REG_DEVICE_STATUS if data.len() == 1 => {
                    inner.status = data[0];
                    if inner.status == 0 {
                        log::debug!("virtio-blk device reset by driver");
                        inner.queue_address = 0;
                    }
                }
                _ => log::warn!("virtio-blk: write to unknown register at {offset:#x}"),
            }
        } else {
            match offset {
                REG_DEVICE_FEATURES if data.len() == 4 => {
                    data.copy_from_slice(&inner.device_features.to_le_bytes());
                }
                REG_QUEUE_ADDRESS if data.len() == 4 => {
                    data.copy_from_slice(&inner.queue_address.to_le_bytes());
                }
                REG_QUEUE_SIZE if data.len() == 2 => {
                    let size = if inner.queue_select == 0 { QUEUE_SIZE } else { 0 };
                    data.copy_from_slice(&size.to_le_bytes());
                }
                REG_DEVICE_STATUS if data.len() == 1 => data[0] = inner.status,
                REG_ISR_STATUS if data.len() == 1 => {
                    data[0] = inner.isr;
                    inner.isr = 0;
                    self.irq.set_level(false);
                }
                offset if offset >= REG_CONFIG && offset < REG_CONFIG + 8 => {
                    let cap = inner.capacity_sectors.to_le_bytes();
                    let start = (offset - REG_CONFIG) as usize;
                    let end = (start + data.len()).min(8);
                    data[..end - start].copy_from_slice(&cap[start..end]);
                }
                _ => data.fill(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct NullIrq {
        active: AtomicBool,
    }
    impl IrqLine for NullIrq {
        fn set_level(&self, active: bool) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    fn backing_file(sectors: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
            .unwrap();
        f
    }

    #[test]
    fn capacity_register_reports_sector_count() {
        let file = backing_file(4);
        let mut dev = VirtioBlk::new(file.path(), Arc::new(NullIrq::default())).unwrap();
        let mut data = [0u8; 8];
        dev.handle_io(&mut data, false, REG_CONFIG);
        assert_eq!(u64::from_le_bytes(data), 4);
    }

    #[test]
    fn isr_read_clears_and_lowers_irq() {
        let file = backing_file(1);
        let mut dev = VirtioBlk::new(file.path(), Arc::new(NullIrq::default())).unwrap();
        dev.inner.lock().unwrap().isr = 0x1;
        let mut data = [0u8; 1];
        dev.handle_io(&mut data, false, REG_ISR_STATUS);
        assert_eq!(data[0], 0x1);
        assert_eq!(dev.inner.lock().unwrap().isr, 0);
    }

    #[test]
    fn queue_select_past_zero_reports_absent_queue() {
        let file = backing_file(1);
        let mut dev = VirtioBlk::new(file.path(), Arc::new(NullIrq::default())).unwrap();
        dev.handle_io(&mut 1u16.to_le_bytes(), true, REG_QUEUE_SELECT);
        let mut data = [0u8; 2];
        dev.handle_io(&mut data, false, REG_QUEUE_SIZE);
        assert_eq!(u16::from_le_bytes(data), 0);
    }

    #[test]
    fn queue_address_round_trips() {
        let file = backing_file(1);
        let mut dev = VirtioBlk::new(file.path(), Arc::new(NullIrq::default())).unwrap();
        dev.handle_io(&mut 0x1234u32.to_le_bytes(), true, REG_QUEUE_ADDRESS);
        let mut data = [0u8; 4];
        dev.handle_io(&mut data, false, REG_QUEUE_ADDRESS);
        assert_eq!(u32::from_le_bytes(data), 0x1234);
    }

    #[test]
    fn status_reset_clears_queue_address() {
        let file = backing_file(1);
        let mut dev = VirtioBlk::new(file.path(), Arc::new(NullIrq::default())).unwrap();
        dev.handle_io(&mut 0x1234u32.to_le_bytes(), true, REG_QUEUE_ADDRESS);
        dev.handle_io(&mut 0u8.to_le_bytes(), true, REG_DEVICE_STATUS);
        let mut data = [0u8; 4];
        dev.handle_io(&mut data, false, REG_QUEUE_ADDRESS);
        assert_eq!(u32::from_le_bytes(data), 0);
    }
}
