// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

extern crate libc;

extern crate linux_loader;
extern crate vm_memory;

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, thread};

use kvm_bindings::{kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};
use linux_loader::loader::{self, KernelLoaderResult};
use vm_memory::{Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

pub mod config;
mod cpu;
mod devices;
mod epoll_context;
mod kernel;

use config::VMMConfig;
use cpu::{cpuid, mptable, Vcpu};
use devices::bus::Bus;
use devices::pci::{PciBridge, PciDevice};
use devices::serial::{IrqLine, Serial, COM1_PORT_BASE, COM1_PORT_SIZE};
use devices::virtio_blk::VirtioBlk;

/// First GSI handed out by [`VMM::alloc_irq`]. Carried over from the source
/// this spec was distilled from, where `vm_alloc_irq` clamps its counter up
/// to an architecture-specific `VM_IRQ_BASE` the first time it is called;
/// only the aarch64 side of that source actually defines the constant
/// (`ARM_GIC_SPI_BASE`). For x86_64 there is no equivalent in the original,
/// so this starts allocation past the legacy PIC lines (PIT=0, keyboard=1,
/// cascade=2, COM2=3, COM1=4).
const VM_IRQ_BASE: u32 = 5;

/// VMM errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to write boot parameters to guest memory.
    #[error("failed to write boot parameters: {0}")]
    BootConfigure(linux_loader::configurator::Error),
    /// Error configuring the kernel command line.
    #[error("invalid kernel command line: {0}")]
    Cmdline(linux_loader::cmdline::Error),
    /// Failed to load kernel.
    #[error("failed to load kernel: {0}")]
    KernelLoad(loader::Error),
    /// Invalid E820 configuration.
    #[error("invalid E820 configuration")]
    E820Configuration,
    /// Highmem start address is past the guest memory end.
    #[error("highmem start is past the end of guest memory")]
    HimemStartPastMemEnd,
    /// I/O error.
    #[error("I/O error: {0}")]
    IO(io::Error),
    /// Error issuing an ioctl to KVM.
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    /// vCPU errors.
    #[error("vCPU error: {0}")]
    Vcpu(cpu::Error),
    /// Memory error.
    #[error("guest memory error: {0}")]
    Memory(vm_memory::Error),
    /// Initramfs couldn't be loaded into guest memory.
    #[error("failed to load initramfs")]
    InitramfsLoad,
    /// No guest-memory region exists to place the initramfs into.
    #[error("no usable guest memory region for the initramfs")]
    InitramfsAddress,
    /// Bad CLI/builder configuration.
    #[error("configuration error: {0}")]
    Config(config::Error),
    /// A device (PCI bridge, UART, virtio-blk) failed to initialize.
    #[error("device error: {0}")]
    Device(devices::Error),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

/// Address Linux expects the initramfs at, and its size, once loaded.
pub struct InitramfsConfig {
    pub address: GuestAddress,
    pub size: usize,
}

/// Host page size, used to align the initramfs load address.
pub(crate) fn pagesize() -> usize {
    // Safe: this just returns an integer, and the underlying libc call
    // cannot fail the way this crate uses it.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Glue from a KVM IRQ line back into the host ioctl, shared by every
/// device that needs to raise a guest interrupt (spec's supplemented
/// `vm_alloc_irq`/`vm_irqfd_register` feature).
struct KvmIrqLine {
    vm_fd: Arc<VmFd>,
    irq: u32,
}

impl IrqLine for KvmIrqLine {
    fn set_level(&self, active: bool) {
        if let Err(e) = self.vm_fd.set_irq_line(self.irq, active) {
            log::warn!("failed to set IRQ {} level: {}", self.irq, e);
        }
    }
}

pub struct VMM {
    vm_fd: Arc<VmFd>,
    kvm: Kvm,
    guest_memory: GuestMemoryMmap,
    vcpu: Option<Vcpu>,
    vcpu_thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,

    io_bus: Arc<Mutex<Bus>>,
    mmio_bus: Arc<Mutex<Bus>>,
    pci: PciBridge,

    // Kept alive for the duration of the VM: dropping `Serial` joins its
    // worker thread, and `VirtioBlk` holds the backing file open.
    _serial: Option<Arc<Mutex<Serial>>>,
    _virtio_blk: Option<Arc<Mutex<VirtioBlk>>>,

    next_irq: u32,
}

impl VMM {
    /// Create a new VMM.
    pub fn new() -> Result<Self> {
        // Open /dev/kvm and get a file descriptor to it.
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;

        // Create a KVM VM object.
        // KVM returns a file descriptor to the VM object.
        let vm_fd = Arc::new(kvm.create_vm().map_err(Error::KvmIoctl)?);

        let io_bus = Arc::new(Mutex::new(Bus::new()));
        let pci = PciBridge::new(&io_bus).map_err(devices::Error::Pci).map_err(Error::Device)?;

        Ok(VMM {
            vm_fd,
            kvm,
            guest_memory: GuestMemoryMmap::default(),
            vcpu: None,
            vcpu_thread: None,
            stop: Arc::new(AtomicBool::new(false)),
            io_bus,
            mmio_bus: Arc::new(Mutex::new(Bus::new())),
            pci,
            _serial: None,
            _virtio_blk: None,
            next_irq: VM_IRQ_BASE,
        })
    }

    /// Hands out the next GSI, clamping the counter up to [`VM_IRQ_BASE`]
    /// the first time it's called (spec's `vm_alloc_irq`).
    fn alloc_irq(&mut self) -> u32 {
        if self.next_irq < VM_IRQ_BASE {
            self.next_irq = VM_IRQ_BASE;
        }
        let irq = self.next_irq;
        self.next_irq += 1;
        irq
    }

    fn irq_line(&self, irq: u32) -> Arc<dyn IrqLine> {
        Arc::new(KvmIrqLine {
            vm_fd: self.vm_fd.clone(),
            irq,
        })
    }

    pub fn configure_memory(&mut self, mem_size_mb: u32) -> Result<()> {
        let mem_size = (mem_size_mb as usize) << 20;
        let guest_memory =
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), mem_size)]).map_err(Error::Memory)?;

        guest_memory
            .iter()
            .enumerate()
            .try_for_each(|(index, region)| {
                let memory_region = kvm_userspace_memory_region {
                    slot: index as u32,
                    guest_phys_addr: region.start_addr().raw_value(),
                    memory_size: region.len(),
                    userspace_addr: guest_memory.get_host_address(region.start_addr()).unwrap()
                        as u64,
                    flags: 0,
                };

                // Safe because the regions we give KVM are valid guest RAM
                // allocated by `GuestMemoryMmap` above, and never overlap.
                unsafe { self.vm_fd.set_user_memory_region(memory_region) }
            })
            .map_err(Error::KvmIoctl)?;

        self.guest_memory = guest_memory;

        Ok(())
    }

    pub fn configure_io(&mut self) -> Result<()> {
        // First, create the irqchip.
        // On `x86_64`, this _must_ be created _before_ the vCPUs.
        // It sets up the virtual IOAPIC, virtual PIC, and sets up the future vCPUs for local APIC.
        // When in doubt, look in the kernel for `KVM_CREATE_IRQCHIP`.
        // https://elixir.bootlin.com/linux/latest/source/arch/x86/kvm/x86.c
        self.vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;

        Ok(())
    }

    /// Attaches the 16550 UART at COM1 unless `no_console` is set.
    fn configure_serial(&mut self, no_console: bool) -> Result<()> {
        if no_console {
            return Ok(());
        }

        let irq = self.alloc_irq();
        let serial = Serial::new(
            io::stdin().as_raw_fd(),
            io::stdout().as_raw_fd(),
            self.irq_line(irq),
        )
        .map_err(devices::Error::Serial)
        .map_err(Error::Device)?;
        let serial = Arc::new(Mutex::new(serial));

        self.io_bus
            .lock()
            .unwrap()
            .register(
                COM1_PORT_BASE as u64,
                COM1_PORT_SIZE as u64,
                serial.clone(),
            )
            .map_err(devices::Error::from)
            .map_err(Error::Device)?;

        self._serial = Some(serial);
        Ok(())
    }

    /// Attaches a legacy virtio-pci block device backed by `path`, if
    /// configured.
    fn configure_disk(&mut self, path: Option<PathBuf>) -> Result<()> {
        let Some(path) = path else {
            return Ok(());
        };

        let irq = self.alloc_irq();
        let virtio_blk = VirtioBlk::new(&path, self.irq_line(irq))
            .map_err(devices::Error::VirtioBlk)
            .map_err(Error::Device)?;
        let virtio_blk: Arc<Mutex<VirtioBlk>> = Arc::new(Mutex::new(virtio_blk));

        let mut pci_dev = PciDevice::new(&self.io_bus, &self.mmio_bus, 0x1af4, 0x1001);
        // virtio legacy: class 0x01 (mass storage), subclass 0x80 (other).
        pci_dev.set_class(0x01, 0x80, 0x00, 0x00);
        pci_dev.set_bar(0, 0x20, true, virtio_blk.clone());

        self.pci
            .register_device(Arc::new(Mutex::new(pci_dev)))
            .map_err(devices::Error::Pci)
            .map_err(Error::Device)?;

        self._virtio_blk = Some(virtio_blk);
        Ok(())
    }

    pub fn configure_vcpus(&mut self, kernel_load: KernelLoaderResult) -> Result<()> {
        mptable::setup_mptable(&self.guest_memory, 1).map_err(|e| Error::Vcpu(cpu::Error::Mptable(e)))?;

        let mut vcpu_cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        let vcpu = Vcpu::new(&self.vm_fd, 0, self.io_bus.clone(), self.mmio_bus.clone())
            .map_err(Error::Vcpu)?;

        // Set CPUID.
        cpuid::filter_cpuid(0, 1, &mut vcpu_cpuid);
        vcpu.configure_cpuid(&vcpu_cpuid).map_err(Error::Vcpu)?;

        // Configure MSRs (model specific registers).
        vcpu.configure_msrs().map_err(Error::Vcpu)?;

        // Configure regs, sregs and fpu.
        vcpu.configure_regs(kernel_load.kernel_load)
            .map_err(Error::Vcpu)?;
        vcpu.configure_sregs(&self.guest_memory).map_err(Error::Vcpu)?;
        vcpu.configure_fpu().map_err(Error::Vcpu)?;

        // Configure LAPIC.
        vcpu.configure_lapic().map_err(Error::Vcpu)?;

        self.vcpu = Some(vcpu);

        Ok(())
    }

    /// Sets up guest memory, the irqchip, the PCI host bridge, the optional
    /// UART/virtio-blk devices, loads the kernel (and initramfs, if any),
    /// and configures the single vCPU ready to run.
    pub fn configure(&mut self, config: VMMConfig) -> Result<()> {
        self.configure_memory(config.memory)?;

        let kernel_load =
            kernel::kernel_setup(&self.guest_memory, config.kernel, config.initramfs)?;

        self.configure_io()?;
        self.configure_serial(config.no_console)?;
        self.configure_disk(config.disk.map(|d| d.path))?;
        self.configure_vcpus(kernel_load)?;

        Ok(())
    }

    /// Spawns the vCPU thread and blocks until the guest halts, shuts down,
    /// or hits a fatal error.
    pub fn run(&mut self) -> Result<()> {
        let mut vcpu = self.vcpu.take().expect("VMM::configure must run before VMM::run");
        let stop = self.stop.clone();

        let handle = thread::Builder::new()
            .name("vcpu0".into())
            .spawn(move || {
                if let Err(e) = vcpu.run(&stop) {
                    log::error!("vCPU 0 exited with error: {}", e);
                    stop.store(true, Ordering::Relaxed);
                }
            })
            .map_err(Error::IO)?;

        self.vcpu_thread = Some(handle);
        if let Some(handle) = self.vcpu_thread.take() {
            let _ = handle.join();
        }

        Ok(())
    }
}
