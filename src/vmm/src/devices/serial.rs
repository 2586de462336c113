// SPDX-License-Identifier: Apache-2.0

//! 16550-compatible UART: register file, tx/rx FIFOs, worker thread, IRQ
//! line. Canonical register offsets and bit layout from
//! `linux/serial_reg.h`; the FIFO/epoll/eventfd variant described in spec
//! §4.4-4.5 (not the simpler cond-var polling variant that ignores FIFO
//! size for THRI timing).

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use vmm_sys_util::eventfd::EventFd;

use crate::epoll_context::EpollContext;
use super::fifo::Fifo;

/// Base I/O port of the emulated COM1 device.
pub const COM1_PORT_BASE: u16 = 0x3f8;
/// Number of consecutive ports the device occupies.
pub const COM1_PORT_SIZE: u16 = 0x8;

// Register offsets (UART_RX/UART_TX share 0; UART_IIR/UART_FCR share 2).
const UART_RX: u64 = 0;
const UART_TX: u64 = 0;
const UART_IER: u64 = 1;
const UART_IIR: u64 = 2;
const UART_FCR: u64 = 2;
const UART_LCR: u64 = 3;
const UART_MCR: u64 = 4;
const UART_LSR: u64 = 5;
const UART_MSR: u64 = 6;
const UART_SCR: u64 = 7;

const UART_LCR_DLAB: u8 = 0x80;

const UART_IER_RDI: u8 = 0x01;
const UART_IER_THRI: u8 = 0x02;
const UART_IER_WRITE_MASK: u8 = 0x0f;

const UART_MCR_LOOP: u8 = 0x10;
const UART_MCR_WRITE_MASK: u8 = 0x3f;

const UART_FCR_ENABLE_FIFO: u8 = 0x01;
const UART_FCR_CLEAR_RCVR: u8 = 0x02;
const UART_FCR_CLEAR_XMIT: u8 = 0x04;
const UART_FCR_64BYTE: u8 = 0x20;
const UART_FCR_WRITE_MASK: u8 = 0b1110_1011;

const UART_LSR_DR: u8 = 0x01;
const UART_LSR_THRE: u8 = 0x20;
const UART_LSR_TEMT: u8 = 0x40;

const UART_IIR_NO_INT: u8 = 0x01;
const UART_IIR_THRI: u8 = 0x02;
const UART_IIR_RDI: u8 = 0x04;
const UART_IIR_FIFO_ENABLED: u8 = 0xc0;
const UART_IIR_FIFO_64BYTE: u8 = 0x20;

const RX_FIFO_CAPACITY: usize = 64;
const TX_FIFO_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create eventfd: {0}")]
    EventFd(#[source] io::Error),
    #[error("failed to create epoll context: {0}")]
    Epoll(#[source] io::Error),
    #[error("failed to spawn UART worker thread")]
    SpawnWorker,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Callback the UART drives to raise or lower its guest IRQ line. Wraps
/// `KVM_IRQ_LINE` at the call site; kept as a trait object so this module
/// has no direct `kvm-ioctls` dependency.
pub trait IrqLine: Send + Sync {
    fn set_level(&self, active: bool);
}

/// Asymmetric lock used purely to park the worker while `MCR.LOOP` is set.
/// The vCPU thread "acquires" it (engages) on the 0->1 edge and "releases"
/// it (disengages) on the 1->0 edge -- ownership transfers across separate
/// register-write calls, which a plain `Mutex` guard cannot model safely,
/// hence the flag + condvar form.
#[derive(Default)]
struct LoopbackGate {
    engaged: Mutex<bool>,
    cond: Condvar,
}

impl LoopbackGate {
    fn engage(&self) {
        *self.engaged.lock().unwrap() = true;
    }

    fn disengage(&self) {
        *self.engaged.lock().unwrap() = false;
        self.cond.notify_all();
    }

    /// Block the calling (worker) thread while loopback is engaged.
    fn wait_while_engaged(&self) {
        let mut g = self.engaged.lock().unwrap();
        while *g {
            g = self.cond.wait(g).unwrap();
        }
    }
}

/// The register file and both FIFOs. Guarded by `Serial::lock`; every
/// mutation that can change the IRQ decision happens here, ending with
/// `update_irq` before the lock is dropped (spec §5 ordering guarantee).
struct Registers {
    dll: u8,
    dlm: u8,
    ier: u8,
    iir: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,
    thr_ipending: bool,
    tx_buf: Fifo,
    rx_buf: Fifo,
}

impl Registers {
    fn new() -> Self {
        Registers {
            dll: 0,
            dlm: 0,
            ier: 0,
            iir: UART_IIR_NO_INT,
            fcr: 0,
            lcr: 0,
            mcr: 0,
            lsr: UART_LSR_TEMT | UART_LSR_THRE,
            msr: 0,
            scr: 0,
            thr_ipending: false,
            tx_buf: Fifo::new(TX_FIFO_CAPACITY),
            rx_buf: Fifo::new(RX_FIFO_CAPACITY),
        }
    }

    /// Spec §4.4 IRQ selection, computed under the caller's lock.
    fn update_irq(&mut self, irq: &dyn IrqLine) {
        let mut iir = UART_IIR_NO_INT;
        if self.ier & UART_IER_RDI != 0 && self.lsr & UART_LSR_DR != 0 {
            iir = UART_IIR_RDI;
        } else if self.ier & UART_IER_THRI != 0 && self.lsr & UART_LSR_THRE != 0 && self.thr_ipending
        {
            iir = UART_IIR_THRI;
        }

        self.iir = iir;
        if self.fcr & UART_FCR_ENABLE_FIFO != 0 {
            self.iir |= UART_IIR_FIFO_ENABLED;
            if self.lcr & UART_LCR_DLAB != 0 && self.fcr & UART_FCR_64BYTE != 0 {
                self.iir |= UART_IIR_FIFO_64BYTE;
            }
        }

        irq.set_level(iir != UART_IIR_NO_INT);
    }

    /// Drain `tx_buf` into `rx_buf` while `MCR.LOOP` is set. Caller holds
    /// both `lock` and the loopback gate.
    fn loopback_drain(&mut self, irq: &dyn IrqLine) {
        while !self.tx_buf.is_empty() && !self.rx_buf.is_full() {
            let byte = self.tx_buf.get().unwrap();
            self.rx_buf.put(byte);
        }
        if self.tx_buf.is_empty() {
            self.lsr |= UART_LSR_TEMT | UART_LSR_THRE;
        }
        if !self.rx_buf.is_empty() {
            self.lsr |= UART_LSR_DR;
        }
        self.update_irq(irq);
    }

    fn read(&mut self, offset: u64, irq: &dyn IrqLine) -> (u8, bool) {
        let mut wake_worker = false;
        let value = match offset {
            UART_RX => {
                if self.lcr & UART_LCR_DLAB != 0 {
                    self.dll
                } else {
                    let level_before = self.rx_buf.level();
                    let byte = self.rx_buf.get().unwrap_or(0);
                    if self.rx_buf.is_empty() {
                        self.lsr &= !UART_LSR_DR;
                        self.update_irq(irq);
                    }
                    if level_before == self.rx_buf.capacity() {
                        wake_worker = true;
                    }
                    byte
                }
            }
            UART_IER => {
                if self.lcr & UART_LCR_DLAB != 0 {
                    self.dlm
                } else {
                    self.ier
                }
            }
            UART_IIR => {
                let was_thri = self.iir & !0xf0 == UART_IIR_THRI;
                let value = self.iir;
                if was_thri {
                    self.thr_ipending = false;
                    self.update_irq(irq);
                }
                value
            }
            UART_LCR => self.lcr,
            UART_MCR => self.mcr,
            UART_LSR => {
                let value = self.lsr;
                self.lsr &= !(UART_LSR_DR);
                self.update_irq(irq);
                value
            }
            UART_MSR => self.msr,
            UART_SCR => self.scr,
            _ => 0,
        };
        (value, wake_worker)
    }

    /// Returns `(signal_worker, loopback_edge)` where `loopback_edge` is
    /// `Some(entering)` when MCR.LOOP just toggled.
    fn write(&mut self, offset: u64, value: u8, irq: &dyn IrqLine) -> (bool, Option<bool>) {
        let mut signal_worker = false;
        let mut loopback_edge = None;
        match offset {
            UART_TX => {
                if self.lcr & UART_LCR_DLAB != 0 {
                    self.dll = value;
                } else {
                    let was_empty = self.tx_buf.is_empty();
                    self.tx_buf.put(value);
                    if self.mcr & UART_MCR_LOOP != 0 {
                        self.loopback_drain(irq);
                    } else if was_empty {
                        self.lsr &= !(UART_LSR_TEMT | UART_LSR_THRE);
                        self.update_irq(irq);
                        signal_worker = true;
                    }
                }
            }
            UART_IER => {
                if self.lcr & UART_LCR_DLAB != 0 {
                    self.dlm = value;
                } else {
                    self.ier = value & UART_IER_WRITE_MASK;
                    self.update_irq(irq);
                }
            }
            UART_FCR => {
                self.fcr = value & UART_FCR_WRITE_MASK;
                if self.fcr & UART_FCR_CLEAR_RCVR != 0 {
                    self.rx_buf.clear();
                    self.lsr &= !UART_LSR_DR;
                }
                if self.fcr & UART_FCR_CLEAR_XMIT != 0 {
                    self.tx_buf.clear();
                    self.lsr |= UART_LSR_TEMT | UART_LSR_THRE;
                    self.thr_ipending = true;
                }
                self.update_irq(irq);
            }
            UART_LCR => {
                self.lcr = value;
                self.update_irq(irq);
            }
            UART_MCR => {
                let was_loop = self.mcr & UART_MCR_LOOP != 0;
                self.mcr = value & UART_MCR_WRITE_MASK;
                let is_loop = self.mcr & UART_MCR_LOOP != 0;
                if !was_loop && is_loop {
                    loopback_edge = Some(true);
                } else if was_loop && !is_loop {
                    loopback_edge = Some(false);
                }
            }
            UART_LSR | UART_MSR => {}
            UART_SCR => self.scr = value,
            _ => {}
        }
        (signal_worker, loopback_edge)
    }
}

/// 16550-compatible UART device: register file, FIFOs, worker thread.
pub struct Serial {
    regs: Arc<Mutex<Registers>>,
    loopback: Arc<LoopbackGate>,
    irq: Arc<dyn IrqLine>,
    evfd: EventFd,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Serial {
    /// `infd`/`outfd` must already be non-blocking (stdin/stdout in this
    /// crate's usage).
    pub fn new(infd: RawFd, outfd: RawFd, irq: Arc<dyn IrqLine>) -> Result<Self> {
        let evfd = EventFd::new(libc::EFD_NONBLOCK).map_err(Error::EventFd)?;
        let regs = Arc::new(Mutex::new(Registers::new()));
        let loopback = Arc::new(LoopbackGate::default());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            regs: regs.clone(),
            loopback: loopback.clone(),
            irq: irq.clone(),
            evfd: evfd.try_clone().map_err(Error::EventFd)?,
            stop: stop.clone(),
            infd,
            outfd,
        };
        let handle = thread::Builder::new()
            .name("uart-worker".into())
            .spawn(move || worker.run())
            .map_err(|_| Error::SpawnWorker)?;

        Ok(Serial {
            regs,
            loopback,
            irq,
            evfd,
            stop,
            worker: Some(handle),
        })
    }

    fn signal_worker(&self) {
        let _ = self.evfd.write(1);
    }
}

impl super::bus::Device for Serial {
    fn handle_io(&mut self, data: &mut [u8], is_write: bool, offset: u64) {
        if is_write {
            let (signal, loopback_edge) = {
                let mut regs = self.regs.lock().unwrap();
                regs.write(offset, data[0], self.irq.as_ref())
            };
            match loopback_edge {
                Some(true) => {
                    self.loopback.engage();
                    self.regs.lock().unwrap().loopback_drain(self.irq.as_ref());
                }
                Some(false) => {
                    self.regs.lock().unwrap().loopback_drain(self.irq.as_ref());
                    self.loopback.disengage();
                }
                None => {}
            }
            if signal {
                self.signal_worker();
            }
        } else {
            let (value, wake) = self.regs.lock().unwrap().read(offset, self.irq.as_ref());
            data[0] = value;
            if wake {
                self.signal_worker();
            }
        }
    }
}

impl Drop for Serial {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Unblock a worker that is parked on the loopback gate.
        self.loopback.disengage();
        self.signal_worker();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

const TOKEN_EVFD: u64 = 1;
const TOKEN_IN: u64 = 2;
const TOKEN_OUT: u64 = 3;

struct Worker {
    regs: Arc<Mutex<Registers>>,
    loopback: Arc<LoopbackGate>,
    irq: Arc<dyn IrqLine>,
    evfd: EventFd,
    stop: Arc<AtomicBool>,
    infd: RawFd,
    outfd: RawFd,
}

impl Worker {
    fn run(self) {
        let epoll_ctx = match EpollContext::new() {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("UART worker failed to create epoll context: {}", e);
                return;
            }
        };
        if let Err(e) = epoll_ctx.add(self.evfd.as_raw_fd(), TOKEN_EVFD, false) {
            log::error!("UART worker failed to register evfd: {}", e);
            return;
        }
        if let Err(e) = epoll_ctx.add(self.infd, TOKEN_IN, true) {
            log::error!("UART worker failed to register stdin: {}", e);
            return;
        }
        if let Err(e) = epoll_ctx.add_writable(self.outfd, TOKEN_OUT, true) {
            log::error!("UART worker failed to register stdout: {}", e);
            return;
        }

        let mut events = [epoll::Event::new(epoll::Events::empty(), 0); 8];
        while !self.stop.load(Ordering::Relaxed) {
            let n = match epoll_ctx.wait(&mut events, -1) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("UART worker epoll_wait failed: {}", e);
                    return;
                }
            };

            for ev in &events[..n] {
                if ev.data() == TOKEN_EVFD {
                    let _ = self.evfd.read();
                }
            }

            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            self.loopback.wait_while_engaged();
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.drain_tx();
            self.fill_rx();
        }
    }

    fn drain_tx(&self) {
        let mut regs = self.regs.lock().unwrap();
        if regs.tx_buf.is_empty() {
            return;
        }
        let (a, b) = regs.tx_buf.readable_regions();
        let written = write_regions(self.outfd, a, b);
        regs.tx_buf.advance_head(written);
        if regs.tx_buf.is_empty() {
            regs.lsr |= UART_LSR_TEMT | UART_LSR_THRE;
            regs.thr_ipending = true;
            regs.update_irq(self.irq.as_ref());
        }
    }

    fn fill_rx(&self) {
        let mut regs = self.regs.lock().unwrap();
        if regs.rx_buf.is_full() {
            return;
        }
        let was_empty = regs.rx_buf.is_empty();
        let (a, b) = regs.rx_buf.writable_regions();
        let read = read_regions(self.infd, a, b);
        regs.rx_buf.advance_tail(read);
        if was_empty && regs.lsr & UART_LSR_DR == 0 && !regs.rx_buf.is_empty() {
            regs.lsr |= UART_LSR_DR;
            regs.update_irq(self.irq.as_ref());
        }
    }
}

use std::os::unix::io::AsRawFd;

/// Best-effort vectored write; short writes are normal for non-blocking
/// fds and simply mean the worker will retry on the next wakeup.
fn write_regions(fd: RawFd, a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() && b.is_empty() {
        return 0;
    }
    let iov = [
        libc::iovec {
            iov_base: a.as_ptr() as *mut libc::c_void,
            iov_len: a.len(),
        },
        libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        },
    ];
    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
    if n < 0 {
        0
    } else {
        n as usize
    }
}

fn read_regions(fd: RawFd, a: &mut [u8], b: &mut [u8]) -> usize {
    if a.is_empty() && b.is_empty() {
        return 0;
    }
    let iov = [
        libc::iovec {
            iov_base: a.as_mut_ptr() as *mut libc::c_void,
            iov_len: a.len(),
        },
        libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        },
    ];
    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as i32) };
    if n < 0 {
        0
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[derive(Default)]
    struct TestIrq {
        active: StdAtomicBool,
    }
    impl IrqLine for TestIrq {
        fn set_level(&self, active: bool) {
            self.active.store(active, Ordering::SeqCst);
        }
    }

    fn irq() -> Arc<TestIrq> {
        Arc::new(TestIrq::default())
    }

    #[test]
    fn rdi_raises_and_lowers_irq() {
        let irq = irq();
        let mut regs = Registers::new();
        regs.write(UART_IER, UART_IER_RDI, irq.as_ref());
        regs.rx_buf.put(b'x');
        regs.lsr |= UART_LSR_DR;
        regs.update_irq(irq.as_ref());
        assert!(irq.active.load(Ordering::SeqCst));
        let (iir, _) = (regs.iir, ());
        assert_eq!(iir & 0x0f, UART_IIR_RDI);

        let (_value, _wake) = regs.read(UART_RX, irq.as_ref());
        assert!(regs.rx_buf.is_empty());
        assert_eq!(regs.lsr & UART_LSR_DR, 0);
        assert!(!irq.active.load(Ordering::SeqCst));
    }

    #[test]
    fn thri_edge_clears_on_iir_read() {
        let irq = irq();
        let mut regs = Registers::new();
        regs.write(UART_IER, UART_IER_THRI, irq.as_ref());
        // tx_buf starts empty -> THRE already set; simulate a write that drains back to empty.
        regs.write(UART_TX, b'A', irq.as_ref());
        regs.thr_ipending = true;
        regs.tx_buf.clear();
        regs.lsr |= UART_LSR_TEMT | UART_LSR_THRE;
        regs.update_irq(irq.as_ref());
        assert_eq!(regs.iir & 0x0f, UART_IIR_THRI);

        let (_iir, _) = regs.read(UART_IIR, irq.as_ref());
        assert!(!regs.thr_ipending);
        assert!(!irq.active.load(Ordering::SeqCst));
    }

    #[test]
    fn loopback_drains_tx_into_rx() {
        let irq = irq();
        let mut regs = Registers::new();
        regs.mcr |= UART_MCR_LOOP;
        regs.tx_buf.put(b'X');
        regs.tx_buf.put(b'Y');
        regs.loopback_drain(irq.as_ref());
        assert_eq!(regs.rx_buf.get(), Some(b'X'));
        assert_eq!(regs.rx_buf.get(), Some(b'Y'));
    }

    #[test]
    fn lcr_dlab_exposes_divisor_latch() {
        let irq = irq();
        let mut regs = Registers::new();
        regs.write(UART_LCR, UART_LCR_DLAB, irq.as_ref());
        regs.write(UART_TX, 0x0c, irq.as_ref());
        regs.write(UART_IER, 0x00, irq.as_ref());
        regs.write(UART_LCR, 0x03, irq.as_ref());
        let (lsr, _) = regs.read(UART_LSR, irq.as_ref());
        assert_eq!(lsr, UART_LSR_TEMT | UART_LSR_THRE);
        assert_eq!(regs.dll, 0x0c);
    }
}
