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

//! An inode represents a file in the filesystem.
//!
//! The name of the file is not included in the inode but in the directory
//! entry associated with it since several entries can refer to the same
//! inode (hard links).

use crate::cache::PageCache;
use crate::dev::BlockDev;
use crate::errno;
use crate::errno::EResult;
use crate::sb::Superblock;
use byteorder::{ByteOrder, LittleEndian};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of an encoded inode, in bytes.
pub const INODE_SIZE: usize = 128;
/// Number of block pointer slots in an inode.
pub const SLOT_COUNT: usize = 12;
/// Number of direct data block slots.
pub const DIRECT_COUNT: usize = 10;
/// Slot holding the single indirect block.
pub const SINGLE_INDIRECT_SLOT: usize = 10;
/// Slot holding the double indirect block.
pub const DOUBLE_INDIRECT_SLOT: usize = 11;

/// The maximum length for a symlink target to be stored inline in the
/// pointer slots instead of separate blocks.
pub const SYMLINK_INLINE_LIMIT: u64 = (SLOT_COUNT * 4) as u64;

/// The inode of the root directory.
pub const ROOT_INO: u32 = 0;

/// Type and permissions of a file.
pub type Mode = u32;

/// Mask of the file type bits in the mode.
pub const S_IFMT: Mode = 0xf000;
/// File type: Unix domain socket.
pub const S_IFSOCK: Mode = 0xc000;
/// File type: symbolic link.
pub const S_IFLNK: Mode = 0xa000;
/// File type: regular file.
pub const S_IFREG: Mode = 0x8000;
/// File type: block device.
pub const S_IFBLK: Mode = 0x6000;
/// File type: directory.
pub const S_IFDIR: Mode = 0x4000;
/// File type: character device.
pub const S_IFCHR: Mode = 0x2000;
/// File type: FIFO.
pub const S_IFIFO: Mode = 0x1000;

/// Returns the current Unix timestamp, in seconds.
pub fn now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// The type of a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
	/// A regular file storing data.
	Regular,
	/// A directory, containing other files.
	Directory,
	/// A symbolic link, pointing to another file.
	Link,
	/// A named pipe.
	Fifo,
	/// A Unix domain socket.
	Socket,
	/// A block device file.
	BlockDevice,
	/// A character device file.
	CharDevice,
}

impl FileType {
	/// Returns the type corresponding to the given `mode`.
	///
	/// The mode is masked with [`S_IFMT`]: permission bits never influence
	/// the result.
	pub fn from_mode(mode: Mode) -> Option<Self> {
		match mode & S_IFMT {
			S_IFREG => Some(Self::Regular),
			S_IFDIR => Some(Self::Directory),
			S_IFLNK => Some(Self::Link),
			S_IFIFO => Some(Self::Fifo),
			S_IFSOCK => Some(Self::Socket),
			S_IFBLK => Some(Self::BlockDevice),
			S_IFCHR => Some(Self::CharDevice),
			_ => None,
		}
	}

	/// Returns the mode bits corresponding to the type.
	pub fn to_mode(self) -> Mode {
		match self {
			Self::Regular => S_IFREG,
			Self::Directory => S_IFDIR,
			Self::Link => S_IFLNK,
			Self::Fifo => S_IFIFO,
			Self::Socket => S_IFSOCK,
			Self::BlockDevice => S_IFBLK,
			Self::CharDevice => S_IFCHR,
		}
	}
}

/// A file's status.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stat {
	/// The inode number.
	pub ino: u32,
	/// Type and permissions.
	pub mode: Mode,
	/// Number of hard links.
	pub nlink: u32,
	/// Size of the file in bytes.
	pub size: u64,
	/// Timestamp of the last metadata modification.
	pub ctime: u64,
	/// Timestamp of the last content modification.
	pub mtime: u64,
	/// Timestamp of the last access.
	pub atime: u64,
}

/// An inode, as stored in the inode table.
///
/// A `mode` of zero means the inode slot is free; the inode bitmap mirrors
/// this.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Inode {
	/// Type and permissions.
	pub mode: Mode,
	/// The number of hard links to this inode.
	pub nlink: u32,
	/// Size of the file in bytes.
	pub size: u64,
	/// Timestamp of the last metadata modification.
	pub ctime: u64,
	/// Timestamp of the last content modification.
	pub mtime: u64,
	/// Timestamp of the last access.
	pub atime: u64,
	/// Block pointer slots.
	///
	/// Slots `0..10` point directly to data blocks. Slot 10 points to the
	/// single indirect block and slot 11 to the double indirect block. For a
	/// short symbolic link, the slots hold the target bytes instead.
	pub direct: [u32; SLOT_COUNT],
}

impl Inode {
	/// Creates a new inode of the given `mode`, with all timestamps set to
	/// the current time.
	pub fn new(mode: Mode) -> Self {
		let now = now();
		Self {
			mode,
			nlink: 0,
			size: 0,
			ctime: now,
			mtime: now,
			atime: now,
			direct: [0; SLOT_COUNT],
		}
	}

	/// Decodes an inode from its on-disk representation.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		if raw.len() < INODE_SIZE {
			return Err(errno!(EUCLEAN));
		}
		let mut direct = [0u32; SLOT_COUNT];
		for (i, d) in direct.iter_mut().enumerate() {
			*d = LittleEndian::read_u32(&raw[40 + i * 4..]);
		}
		Ok(Self {
			mode: LittleEndian::read_u32(&raw[0..]),
			nlink: LittleEndian::read_u32(&raw[4..]),
			size: LittleEndian::read_u64(&raw[8..]),
			ctime: LittleEndian::read_u64(&raw[16..]),
			mtime: LittleEndian::read_u64(&raw[24..]),
			atime: LittleEndian::read_u64(&raw[32..]),
			direct,
		})
	}

	/// Encodes the inode to its on-disk representation.
	pub fn encode(&self) -> [u8; INODE_SIZE] {
		let mut raw = [0u8; INODE_SIZE];
		LittleEndian::write_u32(&mut raw[0..], self.mode);
		LittleEndian::write_u32(&mut raw[4..], self.nlink);
		LittleEndian::write_u64(&mut raw[8..], self.size);
		LittleEndian::write_u64(&mut raw[16..], self.ctime);
		LittleEndian::write_u64(&mut raw[24..], self.mtime);
		LittleEndian::write_u64(&mut raw[32..], self.atime);
		for (i, d) in self.direct.iter().enumerate() {
			LittleEndian::write_u32(&mut raw[40 + i * 4..], *d);
		}
		raw
	}

	/// Tells whether the inode slot is free.
	pub fn is_free(&self) -> bool {
		self.mode == 0
	}

	/// Returns the type of the file.
	pub fn file_type(&self) -> FileType {
		FileType::from_mode(self.mode).unwrap_or(FileType::Regular)
	}

	/// Returns the file's status.
	pub fn stat(&self, ino: u32) -> Stat {
		Stat {
			ino,
			mode: self.mode,
			nlink: self.nlink,
			size: self.size,
			ctime: self.ctime,
			mtime: self.mtime,
			atime: self.atime,
		}
	}
}

/// The inode table: fixed-size records addressed by inode number.
pub struct InodeTable {
	start_block: u32,
	count: u32,
	block_size: u32,
}

impl InodeTable {
	/// Creates the table descriptor from the superblock.
	pub fn new(sb: &Superblock) -> Self {
		Self {
			start_block: sb.inode_table_start,
			count: sb.inode_count,
			block_size: sb.block_size,
		}
	}

	/// Returns the block containing inode `ino` and the record's byte offset
	/// inside that block.
	pub fn locate(&self, ino: u32) -> EResult<(u32, usize)> {
		if ino >= self.count {
			return Err(errno!(EUCLEAN));
		}
		let off = ino as u64 * INODE_SIZE as u64;
		let blk = self.start_block + (off / self.block_size as u64) as u32;
		Ok((blk, (off % self.block_size as u64) as usize))
	}

	/// Reads inode `ino` through the page cache.
	pub fn read(&self, dev: &BlockDev, cache: &PageCache, ino: u32) -> EResult<Inode> {
		let (blk, off) = self.locate(ino)?;
		let raw = cache.get(dev, blk)?;
		Inode::decode(&raw[off..off + INODE_SIZE])
	}
}

/// Computes the indirection offsets to reach the logical block `off`.
///
/// Arguments:
/// - `off` is the logical block index inside the file.
/// - `ptrs_per_blk` is the number of pointers an index block holds.
/// - `offsets` receives the inode slot followed by the index-block offsets.
///
/// On success, the function returns the number of offsets used (1 for a
/// direct block, 2 through the single indirect block, 3 through the double
/// indirect block).
///
/// If the offset is out of bounds, the function returns
/// [`EFBIG`](crate::errno::Errno::EFBIG).
pub(crate) fn indirections_offsets(
	mut off: u64,
	ptrs_per_blk: u32,
	offsets: &mut [usize; 3],
) -> EResult<usize> {
	offsets.fill(0);
	if off < DIRECT_COUNT as u64 {
		offsets[0] = off as usize;
		return Ok(1);
	}
	off -= DIRECT_COUNT as u64;
	let p = ptrs_per_blk as u64;
	if off < p {
		offsets[0] = SINGLE_INDIRECT_SLOT;
		offsets[1] = off as usize;
		return Ok(2);
	}
	off -= p;
	if off < p * p {
		offsets[0] = DOUBLE_INDIRECT_SLOT;
		offsets[1] = (off / p) as usize;
		offsets[2] = (off % p) as usize;
		return Ok(3);
	}
	Err(errno!(EFBIG))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn codec() {
		let mut inode = Inode::new(S_IFREG | 0o644);
		inode.nlink = 2;
		inode.size = 123456;
		inode.direct[0] = 42;
		inode.direct[11] = 7;
		let raw = inode.encode();
		assert_eq!(Inode::decode(&raw).unwrap(), inode);
	}

	#[test]
	fn encoding_is_little_endian() {
		let mut inode = Inode::default();
		inode.mode = 0x0102_0304;
		let raw = inode.encode();
		assert_eq!(&raw[..4], &[0x04, 0x03, 0x02, 0x01]);
	}

	#[test]
	fn free_slot() {
		assert!(Inode::default().is_free());
		assert!(!Inode::new(S_IFDIR | 0o755).is_free());
	}

	#[test]
	fn type_is_masked() {
		// permission bits must not influence the file type
		let inode = Inode::new(S_IFDIR | 0o755);
		assert_eq!(inode.file_type(), FileType::Directory);
		assert_eq!(FileType::from_mode(S_IFLNK | 0o777), Some(FileType::Link));
	}

	#[test]
	fn indirections() {
		let mut offsets = [0usize; 3];
		// direct
		assert_eq!(indirections_offsets(0, 1024, &mut offsets).unwrap(), 1);
		assert_eq!(offsets[0], 0);
		assert_eq!(indirections_offsets(9, 1024, &mut offsets).unwrap(), 1);
		assert_eq!(offsets[0], 9);
		// single indirect
		assert_eq!(indirections_offsets(10, 1024, &mut offsets).unwrap(), 2);
		assert_eq!(offsets, [SINGLE_INDIRECT_SLOT, 0, 0]);
		assert_eq!(
			indirections_offsets(10 + 1023, 1024, &mut offsets).unwrap(),
			2
		);
		assert_eq!(offsets, [SINGLE_INDIRECT_SLOT, 1023, 0]);
		// double indirect
		assert_eq!(
			indirections_offsets(10 + 1024, 1024, &mut offsets).unwrap(),
			3
		);
		assert_eq!(offsets, [DOUBLE_INDIRECT_SLOT, 0, 0]);
		assert_eq!(
			indirections_offsets(10 + 1024 + 1024 * 5 + 3, 1024, &mut offsets).unwrap(),
			3
		);
		assert_eq!(offsets, [DOUBLE_INDIRECT_SLOT, 5, 3]);
		// out of bounds
		let max = 10 + 1024 + 1024 * 1024;
		assert_eq!(
			indirections_offsets(max, 1024, &mut offsets),
			Err(errno!(EFBIG))
		);
	}

	#[test]
	fn table_locate() {
		let sb = Superblock {
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
		};
		let table = InodeTable::new(&sb);
		// 32 inodes per 4096-byte block
		assert_eq!(table.locate(0).unwrap(), (3, 0));
		assert_eq!(table.locate(31).unwrap(), (3, 31 * 128));
		assert_eq!(table.locate(32).unwrap(), (4, 0));
		assert!(table.locate(256).is_err());
	}
}
