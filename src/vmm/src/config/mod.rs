use linux_loader::cmdline::Cmdline;
use std::convert::{TryFrom, TryInto};
use std::path::PathBuf;

mod builder;

const KERNEL_CMDLINE_CAPACITY: usize = 4096;
// Default command line
const KERNEL_CMDLINE_DEFAULT: &str = "console=ttyS0 i8042.nokbd reboot=k panic=1 pci=on";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel configuration error: {0}")]
    KernelConfig(String),
    #[error("disk configuration error: {0}")]
    DiskConfig(String),
    #[error("only a single vCPU is supported, got {0}")]
    UnsupportedCpuCount(u8),
}

/// VMM configuration.
#[derive(Debug)]
pub struct VMMConfig {
    /// Linux kernel path
    pub kernel: KernelConfig,

    /// Number of virtual CPUs assigned to the guest. Always 1: SMP is a
    /// Non-goal, enforced by [`VMMConfigBuilder::build`].
    pub cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    pub memory: u32,

    /// A level of verbosity, and can be used multiple times
    pub verbose: i32,

    /// Stdout console file path
    pub console: Option<String>,

    /// Path to the initramfs image, if any.
    pub initramfs: Option<PathBuf>,

    /// Skip attaching the UART console entirely.
    pub no_console: bool,

    /// Backing image for the optional virtio-blk device
    pub disk: Option<DiskConfig>,
}

/// Store the current state of the kernel & its command line
/// arguments
#[derive(Clone, Debug, PartialEq)]
pub struct KernelConfig {
    /// Path to the kernel binary
    pub kernel_path: PathBuf,

    /// Command line arguments for kernel binary run
    pub cmdline: Cmdline,
}

impl TryFrom<String> for KernelConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        let kernel = KernelConfig {
            kernel_path: path.clone(),
            ..Default::default()
        };

        if !path.exists() {
            return Err(Error::KernelConfig("file does not exist".to_string()));
        }

        Ok(kernel)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            kernel_path: PathBuf::default(),
            cmdline: KernelConfig::default_cmdline(),
        }
    }
}

impl KernelConfig {
    pub fn new(path: String, cfg_cmdline: Option<String>) -> Result<Self, Error> {
        let mut cmdline = Cmdline::new(KERNEL_CMDLINE_CAPACITY);
        cmdline
            .insert_str(cfg_cmdline.unwrap_or_else(|| KERNEL_CMDLINE_DEFAULT.to_string()))
            .map_err(|_| Error::KernelConfig("kernel cmdline exceeds capacity".to_string()))?;

        let mut kernel: KernelConfig = path.try_into()?;
        kernel.cmdline = cmdline;

        Ok(kernel)
    }

    pub fn default_cmdline() -> Cmdline {
        let mut cmd = Cmdline::new(KERNEL_CMDLINE_CAPACITY);
        cmd.insert_str(KERNEL_CMDLINE_DEFAULT).unwrap();
        cmd
    }
}

/// Backing image for the virtio-blk device.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskConfig {
    pub path: PathBuf,
}

impl TryFrom<String> for DiskConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        if !path.exists() {
            return Err(Error::DiskConfig("file does not exist".to_string()));
        }
        Ok(DiskConfig { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn try_from_kernelconfig_succeeds_for_existing_file() {
        let valid_path = String::from("./Cargo.toml");
        let kernel: Result<KernelConfig, Error> = valid_path.try_into();
        assert!(kernel.is_ok())
    }

    #[test]
    fn new_kernelconfig_succeeds_for_existing_file() {
        let valid_path = String::from("./Cargo.toml");
        let kernel = KernelConfig::new(valid_path.clone(), None);
        assert!(kernel.is_ok());
        let kernel = kernel.unwrap();
        assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
    }

    #[test]
    fn new_kernelconfig_fails_for_missing_file() {
        let missing_path = String::from("./Cargo.tomle");
        let kernel = KernelConfig::new(missing_path, None);
        assert!(kernel.is_err());
    }

    #[test]
    fn new_kernelconfig_honors_custom_cmdline() {
        let valid_path = String::from("./Cargo.toml");
        let cmdline = String::from(KERNEL_CMDLINE_DEFAULT);
        let kernel = KernelConfig::new(valid_path.clone(), Some(cmdline.clone()));
        assert!(kernel.is_ok());
        let kernel = kernel.unwrap();
        assert_eq!(kernel.cmdline.as_str(), cmdline);
        assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
    }

    #[test]
    fn try_from_diskconfig_fails_for_missing_file() {
        let target: Result<DiskConfig, Error> = String::from("./nonexistent.img").try_into();
        assert!(matches!(target, Err(Error::DiskConfig(_))));
    }
}
