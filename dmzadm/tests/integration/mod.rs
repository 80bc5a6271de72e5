// vim: tw=80
//! Run the dmzadm binary against image files

use std::{fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::{fixture, rstest};
use tempfile::{Builder, TempDir};

fn dmzadm() -> Command {
    Command::cargo_bin("dmzadm").unwrap()
}

struct Harness {
    images: Vec<PathBuf>,
    config: PathBuf,
    _tempdir: TempDir,
}

/// A 1000-sector image, a 500-sector image, and a configuration file that
/// points at an empty mount table.
#[fixture]
fn harness() -> Harness {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    let images = [1000u64, 500].iter()
        .enumerate()
        .map(|(i, sectors)| {
            let path = tempdir.path().join(format!("img{i}"));
            let f = fs::File::create(&path).unwrap();
            f.set_len(sectors * 512).unwrap();
            path
        }).collect();
    let mounts = tempdir.path().join("mounts");
    fs::write(&mounts, "").unwrap();
    let config = tempdir.path().join("dmz.yaml");
    fs::write(&config, format!("mount_table: {}\nsysfs_root: {}\n",
        mounts.display(), tempdir.path().join("sys").display())).unwrap();
    Harness { images, config, _tempdir: tempdir }
}

#[rstest]
fn report(harness: Harness) {
    dmzadm()
        .args(["report", "--allow-files", "--zone-sectors", "256",
            "--config"])
        .arg(&harness.config)
        .args(&harness.images)
        .assert()
        .success()
        .stdout(predicate::str::contains("1000 512-byte sectors (0 GiB)"))
        .stdout(predicate::str::contains("Regular block device"))
        .stdout(predicate::str::contains("4 zones, offset 0"))
        .stdout(predicate::str::contains("2 zones, offset 125"))
        .stdout(predicate::str::contains("4 zones of 256 512-byte sectors"))
        .stdout(predicate::str::contains("1 runt zone of 232"))
        .stdout(predicate::str::contains("1 runt zone of 244"))
        .stdout(predicate::str::contains("32 4KB data blocks per zone"));
}

#[rstest]
fn report_zones(harness: Harness) {
    dmzadm()
        .args(["report", "--allow-files", "--zone-sectors", "256", "--zones",
            "--config"])
        .arg(&harness.config)
        .args(&harness.images)
        .assert()
        .success()
        .stdout(predicate::str::contains("Zone 000003 (img0)"))
        .stdout(predicate::str::contains("sector 768, 232 sectors"))
        .stdout(predicate::str::contains("Zone 000005 (img1)"));
}

/// Without --allow-files, image files are rejected
#[rstest]
fn not_a_block_device(harness: Harness) {
    dmzadm()
        .args(["report", "--zone-sectors", "256", "--config"])
        .arg(&harness.config)
        .arg(&harness.images[0])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("is not a block device"));
}

/// Formatting needs a zoned device
#[rstest]
fn format_layout(harness: Harness) {
    dmzadm()
        .args(["report", "--format", "--allow-files", "--zone-sectors", "256",
            "--config"])
        .arg(&harness.config)
        .args(&harness.images)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not a zoned block device"));
}

#[rstest]
fn probe(harness: Harness) {
    dmzadm()
        .arg("probe")
        .arg(&harness.images[0])
        .assert()
        .success()
        .stdout(predicate::str::contains("no signature found"));

    fs::write(&harness.images[1], b"XFSB").unwrap();
    dmzadm()
        .arg("probe")
        .arg(&harness.images[1])
        .assert()
        .success()
        .stdout(predicate::str::contains("an existing filesystem (xfs)"));
}

#[rstest]
fn holder(harness: Harness) {
    dmzadm()
        .args(["holder", "--allow-files", "--config"])
        .arg(&harness.config)
        .arg(&harness.images[0])
        .assert()
        .success()
        .stdout(predicate::str::contains("no holder"));
}

#[test]
fn bad_config() {
    let tempdir = Builder::new()
        .prefix(concat!(module_path!(), "."))
        .tempdir()
        .unwrap();
    let config = tempdir.path().join("dmz.yaml");
    fs::write(&config, "mount-table: /proc/mounts\n").unwrap();
    dmzadm()
        .args(["holder", "--config"])
        .arg(&config)
        .arg("/dev/null")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}
