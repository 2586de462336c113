// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper around the `epoll` crate's raw interface, shared by every
//! device worker thread that multiplexes a small, fixed set of fds (the
//! UART worker is the only user today; virtio-blk backends would reuse it).

extern crate epoll;

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::result;

pub struct EpollContext {
    raw_fd: RawFd,
}

impl EpollContext {
    pub fn new() -> result::Result<EpollContext, io::Error> {
        let raw_fd = epoll::create(true)?;
        Ok(EpollContext { raw_fd })
    }

    /// Register `fd` for read readiness under `token`, edge-triggered if
    /// `edge` is set, level-triggered otherwise.
    pub fn add(&self, fd: RawFd, token: u64, edge: bool) -> result::Result<(), io::Error> {
        self.add_events(fd, token, epoll::Events::EPOLLIN, edge)
    }

    /// Register `fd` for write readiness under `token`.
    pub fn add_writable(&self, fd: RawFd, token: u64, edge: bool) -> result::Result<(), io::Error> {
        self.add_events(fd, token, epoll::Events::EPOLLOUT, edge)
    }

    fn add_events(
        &self,
        fd: RawFd,
        token: u64,
        mut flags: epoll::Events,
        edge: bool,
    ) -> result::Result<(), io::Error> {
        if edge {
            flags |= epoll::Events::EPOLLET;
        }
        epoll::ctl(
            self.raw_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(flags, token),
        )
    }

    /// Block for up to `timeout_ms` (-1 blocks indefinitely) and fill
    /// `events` with whatever became ready. Returns the number filled.
    pub fn wait(
        &self,
        events: &mut [epoll::Event],
        timeout_ms: i32,
    ) -> result::Result<usize, io::Error> {
        epoll::wait(self.raw_fd, timeout_ms, events)
    }
}

impl AsRawFd for EpollContext {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}
