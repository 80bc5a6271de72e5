// vim: tw=80
//! Inspect the backing devices of a dm-zoned target

use std::{num::NonZeroU64, path::PathBuf, process::exit};

use clap::{crate_version, ArgAction, Parser};
use dmz_core::{
    bdev::BackingDevice,
    config::{Config, OpenOptions, Operation},
    probe,
    Result,
};
use tracing::debug;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Options that control where dmz-core looks for system information
#[derive(Parser, Clone, Debug)]
struct SysOpts {
    /// Read configuration from this YAML file
    #[clap(long)]
    config:      Option<PathBuf>,
    /// Accept regular files as backing devices
    #[clap(long)]
    allow_files: bool,
}

impl SysOpts {
    fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default()
        };
        config.allow_files |= self.allow_files;
        debug!(?config, "loaded configuration");
        Ok(config)
    }
}

#[derive(Parser, Clone, Debug)]
/// Open a set of devices and describe their geometry
struct Report {
    /// Apply the safety checks used before formatting, and require a usable
    /// dm-zoned layout
    #[clap(long)]
    format:       bool,
    /// With --format, skip the check for existing file systems
    #[clap(short, long)]
    force:        bool,
    /// Zone size, in 512-byte sectors, to emulate when no device is zoned
    #[clap(long)]
    zone_sectors: Option<NonZeroU64>,
    /// Name of the device set in messages
    #[clap(long)]
    label:        Option<String>,
    /// Print every zone
    #[clap(long)]
    zones:        bool,
    #[clap(flatten)]
    sys:          SysOpts,
    /// The cache device, if any, followed by the zoned devices
    #[clap(required(true))]
    devices:      Vec<PathBuf>,
}

impl Report {
    fn main(self) -> Result<()> {
        let op = if self.format {
            Operation::Format
        } else {
            Operation::Inspect
        };
        let mut options = OpenOptions::new(op);
        options.overwrite(self.force)
            .config(self.sys.load()?);
        if let Some(zs) = self.zone_sectors {
            options.zone_sectors(zs);
        }
        if let Some(label) = self.label {
            options.label(label);
        }
        let mut ds = options.open(&self.devices)?;
        for bdev in ds.bdevs() {
            println!("{bdev}");
        }
        println!("{ds}");
        if self.zones {
            for (id, zone) in ds.zones().iter().enumerate() {
                let (bdev, _) = ds.sector_to_bdev(zone.start)
                    .expect("zone outside of the device set");
                println!("{}", zone.display(id as u32,
                    dmz_core::report::ZoneSource::name(bdev)));
            }
        }
        let r = if self.format {
            ds.check_cache_layout()
        } else {
            Ok(())
        };
        ds.close();
        r
    }
}

#[derive(Parser, Clone, Debug)]
/// Show which block-layer consumer holds a device
struct Holder {
    #[clap(flatten)]
    sys:    SysOpts,
    device: PathBuf,
}

impl Holder {
    fn main(self) -> Result<()> {
        let config = self.sys.load()?;
        match BackingDevice::holder(&self.device, &config)? {
            Some(holder) => println!("{}: held by {holder}",
                self.device.display()),
            None => println!("{}: no holder", self.device.display()),
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Look for an existing file system, volume, or partition table on a device
struct Probe {
    device: PathBuf,
}

impl Probe {
    fn main(self) -> Result<()> {
        match probe::probe_content(&self.device)? {
            Some(content) => println!("{}: {content}", self.device.display()),
            None => println!("{}: no signature found", self.device.display()),
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Holder(Holder),
    Probe(Probe),
    Report(Report),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    /// Increase log verbosity.  May be repeated.
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    cmd:     SubCommand,
}

fn main() {
    let cli: Cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy())
        .init();
    let r = match cli.cmd {
        SubCommand::Holder(holder) => holder.main(),
        SubCommand::Probe(probe) => probe.main(),
        SubCommand::Report(report) => report.main(),
    };
    if let Err(e) = r {
        eprintln!("Error: {e}");
        exit(1);
    }
}
