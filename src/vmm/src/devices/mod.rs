// SPDX-License-Identifier: Apache-2.0

pub mod bus;
pub mod fifo;
pub mod pci;
pub mod serial;
pub mod virtio_blk;

/// Custom defined [`std::result::Result`]
pub type Result<T> = std::result::Result<T, Error>;

/// Error related to device emulation: bus registration, PCI config space,
/// and the device worker threads.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus error: {0}")]
    Bus(#[from] bus::Error),

    #[error("PCI error: {0}")]
    Pci(#[from] pci::Error),

    #[error("serial device error: {0}")]
    Serial(#[from] serial::Error),

    #[error("virtio-blk device error: {0}")]
    VirtioBlk(#[from] virtio_blk::Error),
}
