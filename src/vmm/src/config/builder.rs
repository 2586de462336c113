use std::convert::TryInto;
use std::path::PathBuf;

use crate::config::{DiskConfig, Error, KernelConfig, VMMConfig};

impl VMMConfig {
    /// Create the builder to generate a vmm config
    pub fn builder(num_vcpus: u8, mem_size_mb: u32, kernel_path: &str) -> VMMConfigBuilder {
        VMMConfigBuilder::new(num_vcpus, mem_size_mb, kernel_path)
    }
}

/// See [`VMMConfig`] for an explanation of these options.
pub struct VMMConfigBuilder {
    cpus: u8,
    memory: u32,
    kernel_path: String,
    cmdline: Option<String>,
    verbose: i32,
    console: Option<String>,
    initramfs: Option<String>,
    no_console: bool,
    disk: Option<String>,
}

impl VMMConfigBuilder {
    pub fn new(num_vcpus: u8, mem_size_mb: u32, kernel_path: &str) -> Self {
        VMMConfigBuilder {
            cpus: num_vcpus,
            memory: mem_size_mb,
            kernel_path: kernel_path.to_string(),
            cmdline: None,
            verbose: 0,
            console: None,
            initramfs: None,
            no_console: false,
            disk: None,
        }
    }

    pub fn verbose(mut self, lvl: i32) -> Self {
        self.verbose = lvl;
        self
    }

    pub fn console(mut self, console: Option<String>) -> Self {
        self.console = console;
        self
    }

    pub fn cmdline(mut self, cmdline: Option<String>) -> Self {
        self.cmdline = cmdline;
        self
    }

    pub fn initramfs(mut self, initramfs: Option<String>) -> Self {
        self.initramfs = initramfs;
        self
    }

    pub fn no_console(mut self, no_console: bool) -> Self {
        self.no_console = no_console;
        self
    }

    pub fn disk(mut self, disk: Option<String>) -> Self {
        self.disk = disk;
        self
    }

    /// Validates the kernel and (optional) disk paths and enforces the
    /// single-vCPU limit, producing the final immutable config.
    pub fn build(self) -> Result<VMMConfig, Error> {
        if self.cpus != 1 {
            return Err(Error::UnsupportedCpuCount(self.cpus));
        }

        let kernel = KernelConfig::new(self.kernel_path, self.cmdline)?;
        let disk = self.disk.map(DiskConfig::try_from).transpose()?;

        Ok(VMMConfig {
            kernel,
            cpus: self.cpus,
            memory: self.memory,
            verbose: self.verbose,
            console: self.console,
            initramfs: self.initramfs.map(PathBuf::from),
            no_console: self.no_console,
            disk,
        })
    }
}
