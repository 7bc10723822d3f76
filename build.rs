//! Build script for readout-card
//!
//! Reads compile-time configuration from environment variables:
//! - ROC_LOCK_DIR: directory holding channel lock records (default: /dev/shm/readoutcard)
//! - ROC_SYSFS_ROOT: PCI device directory scanned by the device finder (default: /sys/bus/pci/devices)

fn main() {
    // Read configuration from environment (set during build)
    let lock_dir = std::env::var("ROC_LOCK_DIR").unwrap_or_else(|_| "/dev/shm/readoutcard".to_string());
    let sysfs_root =
        std::env::var("ROC_SYSFS_ROOT").unwrap_or_else(|_| "/sys/bus/pci/devices".to_string());

    // Validate
    assert!(lock_dir.starts_with('/'), "ROC_LOCK_DIR must be an absolute path");
    assert!(sysfs_root.starts_with('/'), "ROC_SYSFS_ROOT must be an absolute path");

    // Pass to compiler as env values
    println!("cargo:rustc-env=ROC_DEFAULT_LOCK_DIR={}", lock_dir);
    println!("cargo:rustc-env=ROC_DEFAULT_SYSFS_ROOT={}", sysfs_root);

    // Rebuild if these change
    println!("cargo:rerun-if-env-changed=ROC_LOCK_DIR");
    println!("cargo:rerun-if-env-changed=ROC_SYSFS_ROOT");
}
