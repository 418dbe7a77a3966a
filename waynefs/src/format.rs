/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of WayneFS.
 *
 * WayneFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * WayneFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * WayneFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! Offline formatter: writes an empty but valid image.

use crate::bitmap::Bitmap;
use crate::dev::BlockDev;
use crate::dirent;
use crate::dirent::DirEntry;
use crate::errno;
use crate::errno::EResult;
use crate::inode::{Inode, ROOT_INO, S_IFDIR};
use crate::journal::{JournalSuperblock, JOURNAL_SB_SIZE};
use crate::sb::{Superblock, SB_SIZE};
use std::path::Path;

/// Formatting parameters.
#[derive(Clone, Debug)]
pub struct FormatOpts {
	/// Image size, in mebibytes.
	pub size_mb: u32,
	/// Block size, in bytes.
	pub block_size: u32,
	/// Number of inodes.
	pub inodes: u32,
	/// Journal area size, in bytes.
	pub journal_size: u32,
}

impl Default for FormatOpts {
	fn default() -> Self {
		Self {
			size_mb: 128,
			block_size: 4096,
			inodes: 1024,
			journal_size: 10 * 4096,
		}
	}
}

/// Computes the image layout for `opts`.
///
/// Returns [`ENOSPC`](crate::errno::Errno::ENOSPC) if the requested layout
/// does not fit the image.
pub fn compute_layout(opts: &FormatOpts) -> EResult<Superblock> {
	let block_size = opts.block_size;
	if block_size == 0 || !block_size.is_power_of_two() {
		return Err(errno!(EINVAL));
	}
	let total_blocks = (opts.size_mb as u64 * 1024 * 1024 / block_size as u64) as u32;
	let inode_bitmap_blocks = opts.inodes.div_ceil(8).div_ceil(block_size);
	let block_bitmap_blocks = total_blocks.div_ceil(8).div_ceil(block_size);
	let inode_table_blocks =
		(opts.inodes as u64 * crate::inode::INODE_SIZE as u64).div_ceil(block_size as u64) as u32;
	let journal_area_blocks = opts.journal_size.div_ceil(block_size);
	// The journal superblock plus room for at least one minimal transaction
	if journal_area_blocks < 4 {
		return Err(errno!(EINVAL));
	}
	let inode_bitmap_start = 1;
	let block_bitmap_start = inode_bitmap_start + inode_bitmap_blocks;
	let inode_table_start = block_bitmap_start + block_bitmap_blocks;
	let journal_area_start = inode_table_start + inode_table_blocks;
	let data_start = journal_area_start + journal_area_blocks;
	if data_start >= total_blocks {
		return Err(errno!(ENOSPC));
	}
	Ok(Superblock {
		block_size,
		total_blocks,
		inode_count: opts.inodes,
		inode_bitmap_start,
		inode_bitmap_blocks,
		block_bitmap_start,
		block_bitmap_blocks,
		inode_table_start,
		inode_table_blocks,
		journal_area_start,
		data_start,
	})
}

/// Writes an empty image at `path` and returns its layout.
///
/// The image holds the superblock, zeroed bitmaps with the metadata region
/// and the root directory block marked used, the root inode, the root
/// directory payload and an empty journal.
pub fn make_image(path: &Path, opts: &FormatOpts) -> EResult<Superblock> {
	let sb = compute_layout(opts)?;
	let mut dev = BlockDev::create(path, sb.total_blocks as u64 * sb.block_size as u64)?;
	dev.set_block_size(sb.block_size);
	// Superblock
	let mut blk = vec![0u8; sb.block_size as usize];
	blk[..SB_SIZE].copy_from_slice(&sb.encode());
	dev.write_block(0, &blk)?;
	// Root directory payload
	let root_entries = vec![
		DirEntry::new(ROOT_INO, "."),
		DirEntry::new(ROOT_INO, ".."),
	];
	let payload = dirent::pack(&root_entries);
	let mut blk = vec![0u8; sb.block_size as usize];
	blk[..payload.len()].copy_from_slice(&payload);
	dev.write_block(sb.data_start, &blk)?;
	// Root inode
	let mut root = Inode::new(S_IFDIR | 0o755);
	root.nlink = 2;
	root.size = payload.len() as u64;
	root.direct[0] = sb.data_start;
	let mut blk = vec![0u8; sb.block_size as usize];
	blk[..crate::inode::INODE_SIZE].copy_from_slice(&root.encode());
	dev.write_block(sb.inode_table_start, &blk)?;
	// Journal superblock: empty ring
	let log_start = sb.journal_area_start + 1;
	let jsb = JournalSuperblock {
		start_block: log_start,
		num_blocks: sb.journal_area_blocks() - 1,
		head: log_start,
		tail: log_start,
		last_tid: 0,
	};
	let mut blk = vec![0u8; sb.block_size as usize];
	blk[..JOURNAL_SB_SIZE].copy_from_slice(&jsb.encode());
	dev.write_block(sb.journal_area_start, &blk)?;
	// Bitmaps: root inode, every block below the data region and the root
	// directory block are used
	let mut inode_bitmap = Bitmap::new(
		sb.inode_bitmap_start,
		sb.inode_bitmap_blocks,
		sb.inode_count,
		sb.block_size,
	);
	inode_bitmap.set(ROOT_INO);
	inode_bitmap.flush_direct(&dev)?;
	let mut block_bitmap = Bitmap::new(
		sb.block_bitmap_start,
		sb.block_bitmap_blocks,
		sb.total_blocks,
		sb.block_size,
	);
	for addr in 0..=sb.data_start {
		block_bitmap.set(addr);
	}
	block_bitmap.flush_direct(&dev)?;
	dev.fsync()?;
	Ok(sb)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn layout_fits() {
		let opts = FormatOpts {
			size_mb: 16,
			block_size: 4096,
			inodes: 256,
			journal_size: 10 * 4096,
		};
		let sb = compute_layout(&opts).unwrap();
		assert_eq!(sb.total_blocks, 4096);
		assert_eq!(sb.inode_bitmap_start, 1);
		assert_eq!(sb.inode_bitmap_blocks, 1);
		assert_eq!(sb.block_bitmap_start, 2);
		assert_eq!(sb.block_bitmap_blocks, 1);
		assert_eq!(sb.inode_table_start, 3);
		// 256 inodes of 128 bytes fill 8 blocks of 4096
		assert_eq!(sb.inode_table_blocks, 8);
		assert_eq!(sb.journal_area_start, 11);
		assert_eq!(sb.data_start, 21);
	}

	#[test]
	fn layout_too_large() {
		let opts = FormatOpts {
			size_mb: 1,
			block_size: 4096,
			inodes: 65536,
			journal_size: 10 * 4096,
		};
		assert_eq!(compute_layout(&opts), Err(errno!(ENOSPC)));
	}

	#[test]
	fn rejects_bad_block_size() {
		let opts = FormatOpts {
			block_size: 1000,
			..Default::default()
		};
		assert_eq!(compute_layout(&opts), Err(errno!(EINVAL)));
	}
}
