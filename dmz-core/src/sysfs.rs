// vim: tw=80
//! Block device attributes published through sysfs

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use crate::types::*;

/// A view of a sysfs tree.
///
/// The root is normally `/sys`, but may point anywhere that has the same
/// layout.
#[derive(Clone, Debug)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Sysfs { root: root.as_ref().to_owned() }
    }

    fn class_block(&self, name: &str) -> PathBuf {
        self.root.join("class/block").join(name)
    }

    fn queue(&self, name: &str) -> PathBuf {
        self.root.join("block").join(name).join("queue")
    }

    /// Read the first whitespace-delimited word of an attribute file.
    ///
    /// Returns `Ok(None)` if the attribute doesn't exist.
    fn read_word(attr: &Path) -> Result<Option<String>> {
        match fs::read_to_string(attr) {
            Ok(s) => match s.split_whitespace().next() {
                Some(word) => Ok(Some(word.to_owned())),
                None => Err(Error::AttributeMissingOrMalformed {
                    attr: attr.to_owned(),
                    reason: "Invalid file format".to_owned()
                })
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::os(attr, "read attribute")(e))
        }
    }

    /// Other block-layer consumers stacked on top of the named device, like
    /// an active device-mapper target.
    ///
    /// The holders are returned in lexicographic order.
    pub fn holders(&self, name: &str) -> Result<Vec<String>> {
        let dir = self.class_block(name).join("holders");
        let mut holders = fs::read_dir(&dir)
            .map_err(Error::os(&dir, "scan holders"))?
            .map(|r| r.map(|entry| entry.file_name()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(Error::os(&dir, "scan holders"))?
            .into_iter()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| n != "." && n != "..")
            .collect::<Vec<_>>();
        holders.sort();
        Ok(holders)
    }

    /// Is the named device a partition rather than a whole disk?
    pub fn is_partition(&self, name: &str) -> Result<bool> {
        let attr = self.class_block(name).join("partition");
        match fs::metadata(&attr) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::os(attr, "stat attribute")(e))
        }
    }

    /// Determine the zone model of the named device.
    ///
    /// Partitions are always `Regular`, because the kernel won't report zones
    /// for them even if the whole disk is zoned.
    pub fn model(&self, name: &str) -> Result<Model> {
        if self.is_partition(name)? {
            return Ok(Model::Regular);
        }
        let attr = self.queue(name).join("zoned");
        let model = match Self::read_word(&attr)?.as_deref() {
            Some("host-aware") => Model::HostAware,
            Some("host-managed") => Model::HostManaged,
            _ => Model::Regular
        };
        Ok(model)
    }

    /// The native zone size of the named device, in sectors.
    ///
    /// The value is returned as published.  It is up to the caller to decide
    /// whether it's usable.
    pub fn zone_sectors(&self, name: &str) -> Result<SectorT> {
        let attr = self.queue(name).join("chunk_sectors");
        let word = Self::read_word(&attr)?
            .ok_or_else(|| Error::AttributeMissingOrMalformed {
                attr: attr.clone(),
                reason: "No such attribute".to_owned()
            })?;
        word.parse::<SectorT>()
            .map_err(|e| Error::AttributeMissingOrMalformed {
                attr,
                reason: format!("Invalid value {word:?}: {e}")
            })
    }
}

// LCOV_EXCL_STOP
