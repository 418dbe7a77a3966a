//! Shared helpers for the integration tests.

use std::path::PathBuf;
use waynefs::format::{make_image, FormatOpts};
use waynefs::WayneFs;

/// Returns a unique image path in the system temp directory, removing any
/// leftover from a previous run.
pub fn temp_image(name: &str) -> PathBuf {
	let mut path = std::env::temp_dir();
	path.push(format!("waynefs-test-{}-{name}.img", std::process::id()));
	let _ = std::fs::remove_file(&path);
	path
}

/// Formats a fresh 16 MiB / 4 KiB / 256-inode image and mounts it.
pub fn fresh(name: &str) -> (PathBuf, WayneFs) {
	let path = temp_image(name);
	let opts = FormatOpts {
		size_mb: 16,
		block_size: 4096,
		inodes: 256,
		journal_size: 10 * 4096,
	};
	make_image(&path, &opts).unwrap();
	let fs = WayneFs::mount(&path).unwrap();
	(path, fs)
}
