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

//! The superblock is the layout descriptor of the filesystem, stored at
//! block 0.

use crate::dev::BlockDev;
use crate::errno;
use crate::errno::EResult;
use crate::inode::DIRECT_COUNT;
use byteorder::{ByteOrder, LittleEndian};

/// The filesystem's magic string.
pub const MAGIC: &[u8; 8] = b"WAYNE_FS";
/// Size of the encoded superblock, in bytes: the magic, eleven fields and a
/// reserved word.
pub const SB_SIZE: usize = 8 + 12 * 4;

/// The superblock of the filesystem.
///
/// All integers are stored little-endian on disk. The journal area size is
/// not stored: it is the distance between `journal_area_start` and
/// `data_start`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Superblock {
	/// Size of a block in bytes.
	pub block_size: u32,
	/// Total number of blocks in the image.
	pub total_blocks: u32,
	/// Total number of inodes.
	pub inode_count: u32,
	/// First block of the inode bitmap.
	pub inode_bitmap_start: u32,
	/// Number of blocks of the inode bitmap.
	pub inode_bitmap_blocks: u32,
	/// First block of the block bitmap.
	pub block_bitmap_start: u32,
	/// Number of blocks of the block bitmap.
	pub block_bitmap_blocks: u32,
	/// First block of the inode table.
	pub inode_table_start: u32,
	/// Number of blocks of the inode table.
	pub inode_table_blocks: u32,
	/// First block of the journal area.
	pub journal_area_start: u32,
	/// First block of the data region.
	pub data_start: u32,
}

impl Superblock {
	/// Loads the superblock from block 0 of `dev`.
	///
	/// If the magic string does not match, the function returns
	/// [`EUCLEAN`](crate::errno::Errno::EUCLEAN) and the mount must be
	/// refused.
	pub fn load(dev: &BlockDev) -> EResult<Self> {
		let raw = dev.read_at(0, SB_SIZE)?;
		Self::decode(&raw)
	}

	/// Decodes the superblock from its on-disk representation.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		if raw.len() < SB_SIZE || &raw[..8] != MAGIC {
			return Err(errno!(EUCLEAN));
		}
		let f = |i: usize| LittleEndian::read_u32(&raw[8 + i * 4..]);
		Ok(Self {
			block_size: f(0),
			total_blocks: f(1),
			inode_count: f(2),
			inode_bitmap_start: f(3),
			inode_bitmap_blocks: f(4),
			block_bitmap_start: f(5),
			block_bitmap_blocks: f(6),
			inode_table_start: f(7),
			inode_table_blocks: f(8),
			journal_area_start: f(9),
			data_start: f(10),
		})
	}

	/// Encodes the superblock to its on-disk representation.
	pub fn encode(&self) -> [u8; SB_SIZE] {
		let mut raw = [0u8; SB_SIZE];
		raw[..8].copy_from_slice(MAGIC);
		let fields = [
			self.block_size,
			self.total_blocks,
			self.inode_count,
			self.inode_bitmap_start,
			self.inode_bitmap_blocks,
			self.block_bitmap_start,
			self.block_bitmap_blocks,
			self.inode_table_start,
			self.inode_table_blocks,
			self.journal_area_start,
			self.data_start,
			// reserved
			0,
		];
		for (i, f) in fields.iter().enumerate() {
			LittleEndian::write_u32(&mut raw[8 + i * 4..8 + i * 4 + 4], *f);
		}
		raw
	}

	/// Returns the number of blocks of the journal area.
	pub fn journal_area_blocks(&self) -> u32 {
		self.data_start - self.journal_area_start
	}

	/// Returns the number of block pointers a single index block holds.
	pub fn ptrs_per_block(&self) -> u32 {
		self.block_size / 4
	}

	/// Returns the maximum number of logical blocks a file can address.
	pub fn max_file_blocks(&self) -> u64 {
		let p = self.ptrs_per_block() as u64;
		DIRECT_COUNT as u64 + p + p * p
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample() -> Superblock {
		Superblock {
			block_size: 4096,
			total_blocks: 4096,
			inode_count: 256,
			inode_bitmap_start: 1,
			inode_bitmap_blocks: 1,
			block_bitmap_start: 2,
			block_bitmap_blocks: 1,
			inode_table_start: 3,
			inode_table_blocks: 8,
			journal_area_start: 11,
			data_start: 21,
		}
	}

	#[test]
	fn codec() {
		let sb = sample();
		let raw = sb.encode();
		assert_eq!(&raw[..8], MAGIC);
		assert_eq!(Superblock::decode(&raw).unwrap(), sb);
	}

	#[test]
	fn bad_magic() {
		let mut raw = sample().encode();
		raw[0] = b'X';
		assert_eq!(Superblock::decode(&raw), Err(errno!(EUCLEAN)));
	}

	#[test]
	fn derived_geometry() {
		let sb = sample();
		assert_eq!(sb.journal_area_blocks(), 10);
		assert_eq!(sb.ptrs_per_block(), 1024);
		assert_eq!(sb.max_file_blocks(), 10 + 1024 + 1024 * 1024);
	}
}
