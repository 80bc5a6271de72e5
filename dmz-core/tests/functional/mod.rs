// vim: tw=80
//! Functional tests of dmz-core, using image files in place of disks

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::{Builder, TempDir};

use dmz_core::{config::Config, BYTES_PER_SECTOR, SectorT};

mod device_set;
mod probe;

/// A fake system: image files, an empty sysfs tree, and a mount table.
pub struct Harness {
    pub config: Config,
    pub images: Vec<PathBuf>,
    pub tempdir: TempDir,
}

impl Harness {
    /// Create one image file of each of the given sizes, in sectors.
    pub fn new(sizes: &[SectorT]) -> Self {
        let tempdir = Builder::new()
            .prefix("test_dmz_functional")
            .tempdir()
            .unwrap();
        let mount_table = tempdir.path().join("mounts");
        fs::write(&mount_table, "proc /proc proc rw,nosuid 0 0\n").unwrap();
        let images = sizes.iter()
            .enumerate()
            .map(|(i, sectors)| {
                let path = tempdir.path().join(format!("disk{i}"));
                let f = fs::File::create(&path).unwrap();
                f.set_len(sectors * BYTES_PER_SECTOR).unwrap();
                path
            }).collect();
        let config = Config {
            sysfs_root: tempdir.path().join("sys"),
            mount_table,
            allow_files: true,
        };
        Harness { config, images, tempdir }
    }

    /// Pretend that `path` is mounted
    pub fn mount(&self, path: &Path) {
        let canon = fs::canonicalize(path).unwrap();
        let mut table = fs::read_to_string(&self.config.mount_table).unwrap();
        table.push_str(&format!("{} /mnt ext4 rw,relatime 0 0\n",
            canon.display()));
        fs::write(&self.config.mount_table, table).unwrap();
    }
}
