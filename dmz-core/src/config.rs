// vim: tw=80
//! Configuration and open options

use serde_derive::{Deserialize, Serialize};
use std::{
    fs,
    num::NonZeroU64,
    path::{Path, PathBuf},
};

use crate::{device_set::DeviceSet, types::*};

/// Where to find the system interfaces that dmz-core consults
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the sysfs tree
    pub sysfs_root: PathBuf,
    /// The live mount table
    pub mount_table: PathBuf,
    /// Accept regular files as backing devices.  They will be treated as
    /// regular block devices.
    pub allow_files: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sysfs_root: PathBuf::from("/sys"),
            mount_table: PathBuf::from("/proc/mounts"),
            allow_files: false,
        }
    }
}

impl Config {
    /// Parse a YAML configuration.  `path` is only used for error messages.
    pub fn from_yaml(path: &Path, s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s)
            .map_err(|e| Error::InvalidConfig {
                path: path.to_owned(),
                reason: e.to_string()
            })
    }

    /// Load a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .map_err(Error::os(path, "read configuration"))?;
        Self::from_yaml(path, &s)
    }
}

/// What the caller intends to do with the devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Destructive.  Existing content is checked for first.
    Format,
    /// Read-only examination, like checking or dumping metadata
    Inspect,
}

/// Options and flags used to open a [`DeviceSet`].
///
/// # Examples
/// ```no_run
/// use dmz_core::config::{Operation, OpenOptions};
///
/// let set = OpenOptions::new(Operation::Format)
///     .overwrite(true)
///     .open(&["/dev/nvme0n1", "/dev/sdh"])
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub(crate) op: Operation,
    pub(crate) overwrite: bool,
    pub(crate) zone_sectors: Option<NonZeroU64>,
    pub(crate) label: Option<String>,
    pub(crate) config: Config,
}

impl OpenOptions {
    pub fn new(op: Operation) -> Self {
        OpenOptions {
            op,
            overwrite: false,
            zone_sectors: None,
            label: None,
            config: Config::default(),
        }
    }

    /// Format even if the devices appear to contain something else.
    pub fn overwrite(&mut self, overwrite: bool) -> &mut Self {
        self.overwrite = overwrite;
        self
    }

    /// Zone size to emulate, in sectors, when no backing device is zoned.
    ///
    /// Ignored, with a warning, if any backing device is zoned.
    pub fn zone_sectors(&mut self, zone_sectors: NonZeroU64) -> &mut Self {
        self.zone_sectors = Some(zone_sectors);
        self
    }

    /// Name for the set in diagnostics.  The default is the backing devices'
    /// names, joined by `+`.
    pub fn label<S: Into<String>>(&mut self, label: S) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Open the devices and read their zones.
    ///
    /// The devices are laid out in the order given.
    pub fn open<P: AsRef<Path>>(&self, paths: &[P]) -> Result<DeviceSet> {
        DeviceSet::open(paths, self)
    }
}

// LCOV_EXCL_STOP
