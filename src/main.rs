use clap::Parser;
use log::LevelFilter;
use vmm::config::VMMConfig;
use vmm::VMM;

#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct VMMOpts {
    /// Linux kernel path
    #[clap(short, long)]
    kernel: String,

    /// Initramfs path
    #[clap(short, long)]
    initramfs: Option<String>,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "512")]
    memory: u32,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Stdout console file path
    #[clap(long)]
    console: Option<String>,

    /// Disable the UART console entirely
    #[clap(long)]
    no_console: bool,

    /// Backing file for a virtio-blk disk
    #[clap(long)]
    disk: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(vmm::config::Error),
    #[error("failed to create VMM: {0}")]
    VmmNew(vmm::Error),
    #[error("failed to configure VMM: {0}")]
    VmmConfigure(vmm::Error),
    #[error("VMM run failed: {0}")]
    VmmRun(vmm::Error),
}

fn main() -> Result<(), Error> {
    let opts: VMMOpts = VMMOpts::parse();

    let level = match opts.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    let config = VMMConfig::builder(opts.cpus, opts.memory, &opts.kernel)
        .verbose(opts.verbose as i32)
        .console(opts.console)
        .initramfs(opts.initramfs)
        .no_console(opts.no_console)
        .disk(opts.disk)
        .build()
        .map_err(Error::Config)?;

    // Create a new VMM
    let mut vmm = VMM::new().map_err(Error::VmmNew)?;

    // Configure the VMM:
    // * Number of virtual CPUs
    // * Memory size (in MB)
    // * Path to a Linux kernel
    // * Optional path to console file, initramfs and virtio-blk disk
    vmm.configure(config).map_err(Error::VmmConfigure)?;

    // Run the VMM
    vmm.run().map_err(Error::VmmRun)?;

    Ok(())
}
