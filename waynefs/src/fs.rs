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

//! Filesystem operations.
//!
//! [`WayneFs`] owns every mount-wide subsystem: the block device, the page
//! cache, the bitmaps, the journal, the dentry cache and the open-file
//! table. Its lifetime is mount to unmount.
//!
//! Every mutating operation follows the same template: resolve and validate
//! the paths, compute the update, write pure data blocks through the page
//! cache, then open a transaction, stage the affected metadata and let the
//! scope exit trigger the commit. Failed operations discard the transaction
//! so nothing reaches the log.

use crate::bitmap::Bitmap;
use crate::cache::PageCache;
use crate::dev::BlockDev;
use crate::dirent;
use crate::dirent::DirEntry;
use crate::errno;
use crate::errno::EResult;
use crate::inode::{
	indirections_offsets, now, FileType, Inode, InodeTable, Mode, Stat, DIRECT_COUNT, ROOT_INO,
	SLOT_COUNT, SYMLINK_INLINE_LIMIT, S_IFLNK, S_IFMT, S_IFREG,
};
use crate::journal::{BlockKind, Journal, Transaction};
use crate::limits::SYMLINK_MAX;
use crate::resolve::{split_path, DentryCache};
use crate::sb::Superblock;
use byteorder::{ByteOrder, LittleEndian};
use log::{error, info};
use std::collections::BTreeMap;
use std::path::Path;

/// An entry of the open-file table.
#[derive(Clone, Debug)]
pub struct OpenFile {
	/// The inode the handle refers to.
	pub ino: u32,
	/// The flags the file was opened with.
	pub flags: i32,
	/// The current file offset.
	pub offset: u64,
}

/// Filesystem usage statistics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statfs {
	/// Size of a block in bytes.
	pub block_size: u32,
	/// Total number of blocks.
	pub total_blocks: u32,
	/// Number of free blocks.
	pub free_blocks: u32,
	/// Total number of inodes.
	pub total_inodes: u32,
	/// Number of free inodes.
	pub free_inodes: u32,
}

/// A mounted filesystem.
pub struct WayneFs {
	pub(crate) dev: BlockDev,
	pub(crate) sb: Superblock,
	pub(crate) cache: PageCache,
	pub(crate) itable: InodeTable,
	pub(crate) inode_bitmap: Bitmap,
	pub(crate) block_bitmap: Bitmap,
	pub(crate) journal: Journal,
	pub(crate) dcache: DentryCache,
	open_files: BTreeMap<u64, OpenFile>,
	next_fh: u64,
}

impl WayneFs {
	/// Mounts the filesystem stored in the image file at `path`.
	///
	/// The superblock and the journal superblock are validated, then journal
	/// recovery runs before anything else reads the image.
	pub fn mount(path: impl AsRef<Path>) -> EResult<Self> {
		let mut dev = BlockDev::open(path.as_ref())?;
		let sb = Superblock::load(&dev)?;
		if sb.block_size == 0 || sb.data_start > sb.total_blocks {
			return Err(errno!(EUCLEAN));
		}
		dev.set_block_size(sb.block_size);
		let mut journal = Journal::open(&dev, &sb)?;
		journal.recover(&dev)?;
		let inode_bitmap = Bitmap::load(
			&dev,
			sb.inode_bitmap_start,
			sb.inode_bitmap_blocks,
			sb.inode_count,
		)?;
		let block_bitmap = Bitmap::load(
			&dev,
			sb.block_bitmap_start,
			sb.block_bitmap_blocks,
			sb.total_blocks,
		)?;
		let itable = InodeTable::new(&sb);
		info!(
			"mounted: {} blocks of {} bytes, {} inodes, journal at {}",
			sb.total_blocks, sb.block_size, sb.inode_count, sb.journal_area_start
		);
		Ok(Self {
			dev,
			sb,
			cache: PageCache::new(),
			itable,
			inode_bitmap,
			block_bitmap,
			journal,
			dcache: DentryCache::default(),
			open_files: BTreeMap::new(),
			next_fh: 1,
		})
	}

	/// Returns the superblock.
	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	/// Reads a block through the page cache.
	pub(crate) fn read_block(&self, addr: u32) -> EResult<Vec<u8>> {
		self.cache.get(&self.dev, addr)
	}

	/// Reads the inode `ino`.
	pub(crate) fn read_inode(&self, ino: u32) -> EResult<Inode> {
		self.itable.read(&self.dev, &self.cache, ino)
	}

	/// Returns the entries of the directory described by `inode`.
	pub(crate) fn dir_entries(&self, inode: &Inode) -> EResult<Vec<DirEntry>> {
		if inode.direct[0] == 0 {
			return Ok(Vec::new());
		}
		let raw = self.read_block(inode.direct[0])?;
		Ok(dirent::unpack(&raw))
	}

	/// Translates the logical block `off` of `inode` to a physical address.
	///
	/// Returns 0 if the block is not allocated. An absent index block is
	/// never dereferenced.
	pub(crate) fn block_addr(&self, inode: &Inode, off: u64) -> EResult<u32> {
		let mut offsets = [0usize; 3];
		let depth = indirections_offsets(off, self.sb.ptrs_per_block(), &mut offsets)?;
		let mut addr = inode.direct[offsets[0]];
		for idx in &offsets[1..depth] {
			if addr == 0 {
				return Ok(0);
			}
			let blk = self.read_block(addr)?;
			addr = LittleEndian::read_u32(&blk[idx * 4..]);
		}
		Ok(addr)
	}

	/// Returns the target of the symbolic link described by `inode`.
	///
	/// A short target is stored inline in the pointer slots, a long one in
	/// regular data blocks.
	pub(crate) fn link_target(&self, inode: &Inode) -> EResult<String> {
		let len = inode.size as usize;
		let raw = if inode.size <= SYMLINK_INLINE_LIMIT {
			let mut buf = [0u8; SLOT_COUNT * 4];
			for (i, d) in inode.direct.iter().enumerate() {
				LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *d);
			}
			buf[..len].to_vec()
		} else {
			let bs = self.sb.block_size as usize;
			let mut buf = Vec::with_capacity(len);
			for lb in 0..(len as u64).div_ceil(bs as u64) {
				let addr = self.block_addr(inode, lb)?;
				if addr == 0 {
					return Err(errno!(EUCLEAN));
				}
				buf.extend_from_slice(&self.read_block(addr)?);
			}
			buf.truncate(len);
			buf
		};
		String::from_utf8(raw).map_err(|_| errno!(EUCLEAN))
	}

	/// Opens a transaction scope on the filesystem and runs `f` in it.
	///
	/// On success the transaction commits when the scope exits; on error it
	/// is discarded, its staged writes dropped and the in-memory bitmaps
	/// re-read so no partial mutation survives.
	fn with_tx<R>(&mut self, f: impl FnOnce(&mut Tx<'_>) -> EResult<R>) -> EResult<R> {
		let tx = self.journal.begin();
		let mut tx = Tx {
			fs: self,
			tx,
			done: false,
			bitmaps_dirty: false,
		};
		match f(&mut tx) {
			Ok(r) => {
				tx.commit()?;
				Ok(r)
			}
			Err(e) => {
				tx.discard();
				Err(e)
			}
		}
	}

	/// Allocates a new open-file handle for `ino`.
	fn new_handle(&mut self, ino: u32, flags: i32) -> u64 {
		let fh = self.next_fh;
		self.next_fh += 1;
		self.open_files.insert(
			fh,
			OpenFile {
				ino,
				flags,
				offset: 0,
			},
		);
		fh
	}

	/// Returns the open-file entry for `fh`.
	pub fn handle(&self, fh: u64) -> EResult<&OpenFile> {
		self.open_files.get(&fh).ok_or(errno!(EBADF))
	}

	/// Resolves `path` and returns the file's status.
	pub fn getattr(&mut self, path: &str) -> EResult<Stat> {
		let ino = self.resolve(path)?;
		Ok(self.read_inode(ino)?.stat(ino))
	}

	/// Returns filesystem usage statistics.
	pub fn statfs(&self) -> Statfs {
		Statfs {
			block_size: self.sb.block_size,
			total_blocks: self.sb.total_blocks,
			free_blocks: self.block_bitmap.count_free(),
			total_inodes: self.sb.inode_count,
			free_inodes: self.inode_bitmap.count_free(),
		}
	}

	/// Returns the entries of the directory at `path`, in insertion order.
	pub fn readdir(&mut self, path: &str) -> EResult<Vec<DirEntry>> {
		let ino = self.resolve(path)?;
		let inode = self.read_inode(ino)?;
		if inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		self.dir_entries(&inode)
	}

	/// Opens the file at `path` and returns a handle.
	pub fn open(&mut self, path: &str, flags: i32) -> EResult<u64> {
		let ino = self.resolve(path)?;
		let inode = self.read_inode(ino)?;
		match inode.file_type() {
			FileType::Directory => return Err(errno!(EISDIR)),
			FileType::Link => return Err(errno!(ELOOP)),
			_ => {}
		}
		Ok(self.new_handle(ino, flags))
	}

	/// Releases the handle `fh`.
	pub fn release(&mut self, fh: u64) -> EResult<()> {
		self.open_files.remove(&fh).ok_or(errno!(EBADF))?;
		Ok(())
	}

	/// Reads up to `size` bytes at the current offset of `fh`, advancing it.
	pub fn read_handle(&mut self, fh: u64, size: usize) -> EResult<Vec<u8>> {
		let of = self.handle(fh)?.clone();
		let data = self.read(of.ino, size, of.offset)?;
		if let Some(of) = self.open_files.get_mut(&fh) {
			of.offset += data.len() as u64;
		}
		Ok(data)
	}

	/// Writes `data` at the current offset of `fh`, advancing it.
	pub fn write_handle(&mut self, fh: u64, data: &[u8]) -> EResult<usize> {
		let of = self.handle(fh)?.clone();
		let n = self.write(of.ino, data, of.offset)?;
		if let Some(of) = self.open_files.get_mut(&fh) {
			of.offset += n as u64;
		}
		Ok(n)
	}

	/// Creates a regular file at `path` and returns a handle to it.
	///
	/// The parent's modification times are bumped. No data block is
	/// allocated.
	pub fn create(&mut self, path: &str, mode: Mode) -> EResult<u64> {
		let (parent_path, name) = split_path(path)?;
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let mut entries = self.dir_entries(&parent_inode)?;
		if entries.iter().any(|e| e.name == name) {
			return Err(errno!(EEXIST));
		}
		let mode = if mode & S_IFMT == 0 {
			S_IFREG | mode
		} else {
			mode
		};
		let name = name.to_owned();
		let ino = self.with_tx(|tx| {
			let ino = tx.alloc_inode()?;
			let mut inode = Inode::new(mode);
			inode.nlink = 1;
			tx.write_inode(ino, &inode)?;
			entries.push(DirEntry::new(ino, name));
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(ino)
		})?;
		self.dcache.remove(path);
		Ok(self.new_handle(ino, 0))
	}

	/// Creates a directory at `path`.
	///
	/// One data block is allocated and filled with the `.` and `..`
	/// entries; the parent's link count increments.
	pub fn mkdir(&mut self, path: &str, mode: Mode) -> EResult<()> {
		let (parent_path, name) = split_path(path)?;
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let mut entries = self.dir_entries(&parent_inode)?;
		if entries.iter().any(|e| e.name == name) {
			return Err(errno!(EEXIST));
		}
		let mode = FileType::Directory.to_mode() | (mode & !S_IFMT);
		let name = name.to_owned();
		self.with_tx(|tx| {
			let ino = tx.alloc_inode()?;
			let blk = tx.alloc_block()?;
			let mut inode = Inode::new(mode);
			inode.nlink = 2;
			inode.direct[0] = blk;
			let own = vec![DirEntry::new(ino, "."), DirEntry::new(parent, "..")];
			tx.stage_dir(&mut inode, &own)?;
			tx.write_inode(ino, &inode)?;
			entries.push(DirEntry::new(ino, name));
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			parent_inode.nlink += 1;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(())
		})?;
		self.dcache.remove(path);
		Ok(())
	}

	/// Removes the directory at `path`.
	///
	/// Fails if the directory is the root, or holds entries beyond `.` and
	/// `..`.
	pub fn rmdir(&mut self, path: &str) -> EResult<()> {
		if path.trim_end_matches('/').is_empty() {
			return Err(errno!(EPERM));
		}
		let (parent_path, name) = split_path(path)?;
		let ino = self.resolve(path)?;
		if ino == ROOT_INO {
			return Err(errno!(EPERM));
		}
		let inode = self.read_inode(ino)?;
		if inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let extra = self
			.dir_entries(&inode)?
			.iter()
			.any(|e| e.name != "." && e.name != "..");
		if extra {
			return Err(errno!(ENOTEMPTY));
		}
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		let mut entries = self.dir_entries(&parent_inode)?;
		let name = name.to_owned();
		self.with_tx(|tx| {
			entries.retain(|e| e.name != name);
			if inode.direct[0] != 0 {
				tx.free_block(inode.direct[0]);
			}
			tx.free_inode(ino);
			tx.write_inode(ino, &Inode::default())?;
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			parent_inode.nlink -= 1;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(())
		})?;
		self.dcache.remove_prefix(path);
		Ok(())
	}

	/// Removes the name at `path`.
	///
	/// The target's link count decrements; when it reaches zero, every data
	/// block reachable from the inode is freed, index blocks included.
	pub fn unlink(&mut self, path: &str) -> EResult<()> {
		let (parent_path, name) = split_path(path)?;
		let ino = self.resolve(path)?;
		let mut inode = self.read_inode(ino)?;
		if inode.file_type() == FileType::Directory {
			return Err(errno!(EISDIR));
		}
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		let mut entries = self.dir_entries(&parent_inode)?;
		let name = name.to_owned();
		self.with_tx(|tx| {
			entries.retain(|e| e.name != name);
			inode.nlink = inode.nlink.saturating_sub(1);
			if inode.nlink == 0 {
				tx.free_content(&mut inode)?;
				tx.free_inode(ino);
				tx.write_inode(ino, &Inode::default())?;
			} else {
				inode.ctime = now();
				tx.write_inode(ino, &inode)?;
			}
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(())
		})?;
		self.dcache.remove(path);
		Ok(())
	}

	/// Reads up to `size` bytes of the file `ino` at byte offset `off`.
	///
	/// The read is clamped to the file size. Holes read as zeros. The access
	/// time is bumped.
	pub fn read(&mut self, ino: u32, size: usize, off: u64) -> EResult<Vec<u8>> {
		let mut inode = self.read_inode(ino)?;
		match inode.file_type() {
			FileType::Regular => {}
			FileType::Directory => return Err(errno!(EISDIR)),
			// the pointer slots of a symlink are not block addresses
			_ => return Err(errno!(EINVAL)),
		}
		if off >= inode.size {
			return Ok(Vec::new());
		}
		let len = size.min((inode.size - off) as usize);
		let bs = self.sb.block_size as u64;
		let mut out = vec![0u8; len];
		let mut copied = 0usize;
		while copied < len {
			let pos = off + copied as u64;
			let inner = (pos % bs) as usize;
			let n = (bs as usize - inner).min(len - copied);
			let addr = self.block_addr(&inode, pos / bs)?;
			if addr != 0 {
				let blk = self.read_block(addr)?;
				out[copied..copied + n].copy_from_slice(&blk[inner..inner + n]);
			}
			copied += n;
		}
		inode.atime = now();
		self.with_tx(|tx| tx.write_inode(ino, &inode))?;
		Ok(out)
	}

	/// Writes `data` to the file `ino` at byte offset `off`.
	///
	/// Covered blocks are allocated as needed. Partial blocks are
	/// read-modified-written; full blocks bypass the pre-read. The size
	/// grows to `max(size, off + len)` and the modification time is bumped.
	pub fn write(&mut self, ino: u32, data: &[u8], off: u64) -> EResult<usize> {
		let mut inode = self.read_inode(ino)?;
		if inode.is_free() {
			return Err(errno!(EINVAL));
		}
		match inode.file_type() {
			FileType::Regular => {}
			FileType::Directory => return Err(errno!(EISDIR)),
			_ => return Err(errno!(EINVAL)),
		}
		if data.is_empty() {
			return Ok(0);
		}
		let end = off
			.checked_add(data.len() as u64)
			.ok_or(errno!(EOVERFLOW))?;
		let bs = self.sb.block_size as u64;
		if end.div_ceil(bs) > self.sb.max_file_blocks() {
			return Err(errno!(EFBIG));
		}
		self.with_tx(|tx| {
			let mut written = 0usize;
			while written < data.len() {
				let pos = off + written as u64;
				let inner = (pos % bs) as usize;
				let n = (bs as usize - inner).min(data.len() - written);
				let prev = tx.block_addr(&inode, pos / bs)?;
				let addr = tx.map_block(&mut inode, pos / bs)?;
				let blk = if n == bs as usize {
					// Full block: no pre-read
					data[written..written + n].to_vec()
				} else {
					let mut blk = if prev == 0 {
						// Fresh block: start from zeros
						vec![0u8; bs as usize]
					} else {
						tx.read_block(prev)?
					};
					blk[inner..inner + n].copy_from_slice(&data[written..written + n]);
					blk
				};
				tx.write_data(addr, blk);
				written += n;
			}
			inode.size = inode.size.max(end);
			inode.mtime = now();
			tx.write_inode(ino, &inode)?;
			Ok(())
		})?;
		Ok(data.len())
	}

	/// Truncates the file `ino` to `len` bytes.
	///
	/// Extending fills the new blocks with zeros. Shrinking frees the
	/// blocks strictly beyond the new last block, and index blocks once
	/// they reference nothing.
	pub fn truncate(&mut self, ino: u32, len: u64) -> EResult<()> {
		let mut inode = self.read_inode(ino)?;
		if inode.is_free() {
			return Err(errno!(EINVAL));
		}
		match inode.file_type() {
			FileType::Regular => {}
			FileType::Directory => return Err(errno!(EISDIR)),
			_ => return Err(errno!(EINVAL)),
		}
		let bs = self.sb.block_size as u64;
		let new_blocks = len.div_ceil(bs);
		if new_blocks > self.sb.max_file_blocks() {
			return Err(errno!(EFBIG));
		}
		let old_blocks = inode.size.div_ceil(bs);
		self.with_tx(|tx| {
			if new_blocks > old_blocks {
				for lb in old_blocks..new_blocks {
					let addr = tx.map_block(&mut inode, lb)?;
					tx.write_data(addr, vec![0u8; bs as usize]);
				}
			} else if new_blocks < old_blocks {
				tx.shrink(&mut inode, new_blocks)?;
			}
			inode.size = len;
			let ts = now();
			inode.mtime = ts;
			inode.ctime = ts;
			tx.write_inode(ino, &inode)?;
			Ok(())
		})
	}

	/// Renames `old` to `new`.
	///
	/// If `new` exists it is removed first, like `rmdir` for an empty
	/// directory or `unlink` otherwise. Moving a directory across parents
	/// rewrites its `..` entry and adjusts both parents' link counts. The
	/// whole operation is one transaction.
	pub fn rename(&mut self, old: &str, new: &str) -> EResult<()> {
		if old == new {
			return Ok(());
		}
		let (old_parent_path, old_name) = split_path(old)?;
		let (new_parent_path, new_name) = split_path(new)?;
		let old_parent = self.resolve(old_parent_path)?;
		let new_parent = self.resolve(new_parent_path)?;
		let same_parent = old_parent == new_parent;
		let mut old_parent_inode = self.read_inode(old_parent)?;
		if old_parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let mut old_entries = self.dir_entries(&old_parent_inode)?;
		let Some(ino) = old_entries
			.iter()
			.find(|e| e.name == old_name)
			.map(|e| e.ino)
		else {
			return Err(errno!(ENOENT));
		};
		let inode = self.read_inode(ino)?;
		let is_dir = inode.file_type() == FileType::Directory;
		let mut new_parent_inode = if same_parent {
			None
		} else {
			let n = self.read_inode(new_parent)?;
			if n.file_type() != FileType::Directory {
				return Err(errno!(ENOTDIR));
			}
			Some(n)
		};
		let mut new_entries = if same_parent {
			None
		} else {
			Some(self.dir_entries(new_parent_inode.as_ref().unwrap())?)
		};
		// Moving a directory under itself would disconnect it
		if is_dir && !same_parent {
			if new_parent == ino {
				return Err(errno!(EINVAL));
			}
			let mut cur = new_parent;
			while cur != ROOT_INO {
				let cur_inode = self.read_inode(cur)?;
				let parent = self
					.dir_entries(&cur_inode)?
					.iter()
					.find(|e| e.name == "..")
					.map(|e| e.ino)
					.unwrap_or(ROOT_INO);
				if parent == ino {
					return Err(errno!(EINVAL));
				}
				if parent == cur {
					break;
				}
				cur = parent;
			}
		}
		// Victim validation
		let victim = {
			let list = if same_parent {
				&old_entries
			} else {
				new_entries.as_ref().unwrap()
			};
			list.iter().find(|e| e.name == new_name).map(|e| e.ino)
		};
		if victim == Some(ino) {
			// Both names already refer to the same inode
			return Ok(());
		}
		if let Some(nino) = victim {
			let ninode = self.read_inode(nino)?;
			let victim_is_dir = ninode.file_type() == FileType::Directory;
			if is_dir && !victim_is_dir {
				return Err(errno!(ENOTDIR));
			}
			if !is_dir && victim_is_dir {
				return Err(errno!(EISDIR));
			}
			if victim_is_dir {
				let extra = self
					.dir_entries(&ninode)?
					.iter()
					.any(|e| e.name != "." && e.name != "..");
				if extra {
					return Err(errno!(ENOTEMPTY));
				}
			}
		}
		let old_name = old_name.to_owned();
		let new_name = new_name.to_owned();
		self.with_tx(|tx| {
			old_entries.retain(|e| e.name != old_name);
			// Remove the victim first
			if let Some(nino) = victim {
				let list = if same_parent {
					&mut old_entries
				} else {
					new_entries.as_mut().unwrap()
				};
				list.retain(|e| e.name != new_name);
				let mut ninode = tx.read_inode(nino)?;
				if ninode.file_type() == FileType::Directory {
					if ninode.direct[0] != 0 {
						tx.free_block(ninode.direct[0]);
					}
					tx.free_inode(nino);
					tx.write_inode(nino, &Inode::default())?;
					// Its `..` entry no longer exists
					if same_parent {
						old_parent_inode.nlink -= 1;
					} else {
						new_parent_inode.as_mut().unwrap().nlink -= 1;
					}
				} else {
					ninode.nlink = ninode.nlink.saturating_sub(1);
					if ninode.nlink == 0 {
						tx.free_content(&mut ninode)?;
						tx.free_inode(nino);
						tx.write_inode(nino, &Inode::default())?;
					} else {
						ninode.ctime = now();
						tx.write_inode(nino, &ninode)?;
					}
				}
			}
			// Insert the new name
			if same_parent {
				old_entries.push(DirEntry::new(ino, new_name.clone()));
			} else {
				new_entries
					.as_mut()
					.unwrap()
					.push(DirEntry::new(ino, new_name.clone()));
			}
			// A moved directory points to its new parent
			if is_dir && !same_parent {
				let mut moved = tx.read_inode(ino)?;
				let mut own = {
					let raw = tx.read_block(moved.direct[0])?;
					dirent::unpack(&raw)
				};
				for e in own.iter_mut() {
					if e.name == ".." {
						e.ino = new_parent;
					}
				}
				tx.stage_dir(&mut moved, &own)?;
				tx.write_inode(ino, &moved)?;
				old_parent_inode.nlink -= 1;
				new_parent_inode.as_mut().unwrap().nlink += 1;
			}
			let ts = now();
			old_parent_inode.mtime = ts;
			old_parent_inode.ctime = ts;
			tx.stage_dir(&mut old_parent_inode, &old_entries)?;
			tx.write_inode(old_parent, &old_parent_inode)?;
			if let Some(npi) = new_parent_inode.as_mut() {
				npi.mtime = ts;
				npi.ctime = ts;
				tx.stage_dir(npi, new_entries.as_ref().unwrap())?;
				tx.write_inode(new_parent, npi)?;
			}
			Ok(())
		})?;
		self.dcache.remove_prefix(old);
		self.dcache.remove_prefix(new);
		Ok(())
	}

	/// Creates a hard link at `new` to the file at `existing`.
	///
	/// Directories cannot be linked.
	pub fn link(&mut self, new: &str, existing: &str) -> EResult<()> {
		let ino = self.resolve(existing)?;
		let mut inode = self.read_inode(ino)?;
		if inode.file_type() == FileType::Directory {
			return Err(errno!(EPERM));
		}
		let (parent_path, name) = split_path(new)?;
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let mut entries = self.dir_entries(&parent_inode)?;
		if entries.iter().any(|e| e.name == name) {
			return Err(errno!(EEXIST));
		}
		let name = name.to_owned();
		self.with_tx(|tx| {
			inode.nlink += 1;
			inode.ctime = now();
			tx.write_inode(ino, &inode)?;
			entries.push(DirEntry::new(ino, name));
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(())
		})?;
		self.dcache.remove(new);
		Ok(())
	}

	/// Creates a symbolic link at `new` pointing to `target`.
	///
	/// A target of at most 48 bytes is stored inline in the pointer slots;
	/// a longer one spills to data blocks.
	pub fn symlink(&mut self, new: &str, target: &str) -> EResult<()> {
		if target.len() > SYMLINK_MAX {
			return Err(errno!(ENAMETOOLONG));
		}
		let (parent_path, name) = split_path(new)?;
		let parent = self.resolve(parent_path)?;
		let mut parent_inode = self.read_inode(parent)?;
		if parent_inode.file_type() != FileType::Directory {
			return Err(errno!(ENOTDIR));
		}
		let mut entries = self.dir_entries(&parent_inode)?;
		if entries.iter().any(|e| e.name == name) {
			return Err(errno!(EEXIST));
		}
		let bs = self.sb.block_size as usize;
		let name = name.to_owned();
		self.with_tx(|tx| {
			let ino = tx.alloc_inode()?;
			let mut inode = Inode::new(S_IFLNK | 0o777);
			inode.nlink = 1;
			inode.size = target.len() as u64;
			if inode.size <= SYMLINK_INLINE_LIMIT {
				let mut buf = [0u8; SLOT_COUNT * 4];
				buf[..target.len()].copy_from_slice(target.as_bytes());
				for (i, d) in inode.direct.iter_mut().enumerate() {
					*d = LittleEndian::read_u32(&buf[i * 4..]);
				}
			} else {
				for (lb, chunk) in target.as_bytes().chunks(bs).enumerate() {
					let addr = tx.map_block(&mut inode, lb as u64)?;
					let mut blk = vec![0u8; bs];
					blk[..chunk.len()].copy_from_slice(chunk);
					tx.write_data(addr, blk);
				}
			}
			tx.write_inode(ino, &inode)?;
			entries.push(DirEntry::new(ino, name));
			let ts = now();
			parent_inode.mtime = ts;
			parent_inode.ctime = ts;
			tx.stage_dir(&mut parent_inode, &entries)?;
			tx.write_inode(parent, &parent_inode)?;
			Ok(())
		})?;
		self.dcache.remove(new);
		Ok(())
	}

	/// Returns the target of the symbolic link at `path`.
	pub fn readlink(&mut self, path: &str) -> EResult<String> {
		let ino = self.resolve(path)?;
		let inode = self.read_inode(ino)?;
		if inode.file_type() != FileType::Link {
			return Err(errno!(EINVAL));
		}
		self.link_target(&inode)
	}

	/// Updates the permission bits of the file at `path`.
	pub fn chmod(&mut self, path: &str, mode: Mode) -> EResult<()> {
		let ino = self.resolve(path)?;
		let mut inode = self.read_inode(ino)?;
		inode.mode = (inode.mode & S_IFMT) | (mode & !S_IFMT);
		inode.ctime = now();
		self.with_tx(|tx| tx.write_inode(ino, &inode))
	}

	/// Updates the access and modification times of the file at `path`.
	///
	/// `None` leaves the corresponding field untouched.
	pub fn utimens(&mut self, path: &str, atime: Option<u64>, mtime: Option<u64>) -> EResult<()> {
		let ino = self.resolve(path)?;
		let mut inode = self.read_inode(ino)?;
		if let Some(t) = atime {
			inode.atime = t;
		}
		if let Some(t) = mtime {
			inode.mtime = t;
		}
		inode.ctime = now();
		self.with_tx(|tx| tx.write_inode(ino, &inode))
	}

	/// Flushes every dirty cached block and the device itself.
	pub fn sync(&mut self) -> EResult<()> {
		self.cache.flush(&self.dev)?;
		self.dev.fsync()
	}
}

/// A transaction scope over the filesystem.
///
/// The scope collects metadata writes and allocator mutations; dropping it
/// commits them through the journal. The drop hook never panics: a commit
/// failure on the implicit path is logged. Error paths call
/// [`discard`](Tx::discard) so a failed operation commits nothing and the
/// in-memory bitmaps are re-read from disk.
struct Tx<'f> {
	fs: &'f mut WayneFs,
	tx: Transaction,
	done: bool,
	bitmaps_dirty: bool,
}

impl Tx<'_> {
	/// Reads a block, seeing the transaction's own staged writes.
	fn read_block(&self, addr: u32) -> EResult<Vec<u8>> {
		if let Some(staged) = self.tx.staged(addr) {
			return Ok(staged.to_vec());
		}
		self.fs.read_block(addr)
	}

	/// Stages a metadata write.
	fn write(&mut self, addr: u32, data: Vec<u8>, kind: BlockKind) {
		self.tx.write(addr, data, kind);
	}

	/// Writes a data block through the page cache and registers it as an
	/// ordered-data dependency of the transaction.
	fn write_data(&mut self, addr: u32, data: Vec<u8>) {
		self.fs.cache.put(addr, data);
		self.fs.cache.mark_dirty(addr);
		self.tx.add_ordered(addr);
	}

	/// Reads the inode `ino`, seeing staged updates to its containing
	/// block.
	fn read_inode(&self, ino: u32) -> EResult<Inode> {
		let (blk, off) = self.fs.itable.locate(ino)?;
		let raw = self.read_block(blk)?;
		Inode::decode(&raw[off..])
	}

	/// Stages an update of the inode `ino`.
	///
	/// The containing block is read-modified-written so several inode
	/// updates within one transaction coalesce into one log entry.
	fn write_inode(&mut self, ino: u32, inode: &Inode) -> EResult<()> {
		let (blk, off) = self.fs.itable.locate(ino)?;
		let mut raw = self.read_block(blk)?;
		raw[off..off + crate::inode::INODE_SIZE].copy_from_slice(&inode.encode());
		self.write(blk, raw, BlockKind::InodeTable);
		Ok(())
	}

	/// Stages the payload of a directory and updates its inode's size.
	fn stage_dir(&mut self, dir_inode: &mut Inode, entries: &[DirEntry]) -> EResult<()> {
		let bs = self.fs.sb.block_size as usize;
		let mut payload = dirent::pack(entries);
		if payload.len() > bs {
			return Err(errno!(ENOSPC));
		}
		dir_inode.size = payload.len() as u64;
		payload.resize(bs, 0);
		debug_assert!(dir_inode.direct[0] != 0);
		self.write(dir_inode.direct[0], payload, BlockKind::Directory);
		Ok(())
	}

	/// Allocates an inode.
	///
	/// Inode 0 is the root and is never handed out again.
	fn alloc_inode(&mut self) -> EResult<u32> {
		let ino = self
			.fs
			.inode_bitmap
			.find_free(1)
			.ok_or(errno!(ENOSPC))?;
		self.fs.inode_bitmap.set(ino);
		self.bitmaps_dirty = true;
		Ok(ino)
	}

	/// Frees an inode.
	fn free_inode(&mut self, ino: u32) {
		self.fs.inode_bitmap.clear(ino);
		self.bitmaps_dirty = true;
	}

	/// Allocates a data block.
	///
	/// The scan starts at `data_start`: metadata regions are never handed
	/// out.
	fn alloc_block(&mut self) -> EResult<u32> {
		let addr = self
			.fs
			.block_bitmap
			.find_free(self.fs.sb.data_start)
			.ok_or(errno!(ENOSPC))?;
		self.fs.block_bitmap.set(addr);
		self.bitmaps_dirty = true;
		Ok(addr)
	}

	/// Frees a data block.
	fn free_block(&mut self, addr: u32) {
		self.fs.block_bitmap.clear(addr);
		self.bitmaps_dirty = true;
	}

	/// Translates the logical block `off` of `inode`, seeing index blocks
	/// staged by this transaction.
	fn block_addr(&self, inode: &Inode, off: u64) -> EResult<u32> {
		let mut offsets = [0usize; 3];
		let depth = indirections_offsets(off, self.fs.sb.ptrs_per_block(), &mut offsets)?;
		let mut addr = inode.direct[offsets[0]];
		for idx in &offsets[1..depth] {
			if addr == 0 {
				return Ok(0);
			}
			let blk = self.read_block(addr)?;
			addr = LittleEndian::read_u32(&blk[idx * 4..]);
		}
		Ok(addr)
	}

	/// Returns the physical address of the logical block `off` of `inode`,
	/// allocating the leaf and any missing index block.
	///
	/// Updated index blocks are staged; fresh index blocks start zeroed.
	fn map_block(&mut self, inode: &mut Inode, off: u64) -> EResult<u32> {
		let mut offsets = [0usize; 3];
		let depth = indirections_offsets(off, self.fs.sb.ptrs_per_block(), &mut offsets)?;
		let bs = self.fs.sb.block_size as usize;
		let mut addr = inode.direct[offsets[0]];
		if addr == 0 {
			addr = self.alloc_block()?;
			if depth > 1 {
				self.write(addr, vec![0u8; bs], BlockKind::Indirect);
			}
			inode.direct[offsets[0]] = addr;
		}
		for (level, idx) in offsets[1..depth].iter().enumerate() {
			let mut blk = self.read_block(addr)?;
			let mut next = LittleEndian::read_u32(&blk[idx * 4..]);
			if next == 0 {
				next = self.alloc_block()?;
				// Only a non-leaf child is an index block
				if level + 2 < depth {
					self.write(next, vec![0u8; bs], BlockKind::Indirect);
				}
				LittleEndian::write_u32(&mut blk[idx * 4..idx * 4 + 4], next);
				self.write(addr, blk, BlockKind::Indirect);
			}
			addr = next;
		}
		Ok(addr)
	}

	/// Frees every pointer at index `keep` and beyond in the index block at
	/// `addr`, staging the update when pointers remain.
	///
	/// Returns whether any pointer is kept.
	fn shrink_index(&mut self, addr: u32, keep: u64) -> EResult<bool> {
		let p = self.fs.sb.ptrs_per_block() as usize;
		let mut blk = self.read_block(addr)?;
		let mut modified = false;
		let mut any = false;
		for i in 0..p {
			let ptr = LittleEndian::read_u32(&blk[i * 4..]);
			if ptr == 0 {
				continue;
			}
			if (i as u64) >= keep {
				self.free_block(ptr);
				LittleEndian::write_u32(&mut blk[i * 4..i * 4 + 4], 0);
				modified = true;
			} else {
				any = true;
			}
		}
		if any && modified {
			self.write(addr, blk, BlockKind::Indirect);
		}
		Ok(any)
	}

	/// Frees every block of `inode` at logical index `new_blocks` and
	/// beyond, and every index block left without a referenced child.
	fn shrink(&mut self, inode: &mut Inode, new_blocks: u64) -> EResult<()> {
		let p = self.fs.sb.ptrs_per_block() as u64;
		for slot in 0..DIRECT_COUNT {
			if (slot as u64) >= new_blocks && inode.direct[slot] != 0 {
				self.free_block(inode.direct[slot]);
				inode.direct[slot] = 0;
			}
		}
		let single = inode.direct[crate::inode::SINGLE_INDIRECT_SLOT];
		if single != 0 {
			let keep = new_blocks.saturating_sub(DIRECT_COUNT as u64).min(p);
			if !self.shrink_index(single, keep)? {
				self.free_block(single);
				inode.direct[crate::inode::SINGLE_INDIRECT_SLOT] = 0;
			}
		}
		let double = inode.direct[crate::inode::DOUBLE_INDIRECT_SLOT];
		if double != 0 {
			let base = DIRECT_COUNT as u64 + p;
			let keep_total = new_blocks.saturating_sub(base);
			let keep_l1 = keep_total.div_ceil(p);
			let mut top = self.read_block(double)?;
			let mut modified = false;
			for j in 0..p as usize {
				let l1 = LittleEndian::read_u32(&top[j * 4..]);
				if l1 == 0 {
					continue;
				}
				if (j as u64) >= keep_l1 {
					self.shrink_index(l1, 0)?;
					self.free_block(l1);
					LittleEndian::write_u32(&mut top[j * 4..j * 4 + 4], 0);
					modified = true;
				} else if (j as u64) == keep_l1 - 1 {
					let keep_in = keep_total - j as u64 * p;
					if keep_in < p {
						self.shrink_index(l1, keep_in)?;
					}
				}
			}
			if keep_l1 == 0 {
				self.free_block(double);
				inode.direct[crate::inode::DOUBLE_INDIRECT_SLOT] = 0;
			} else if modified {
				self.write(double, top, BlockKind::Indirect);
			}
		}
		Ok(())
	}

	/// Frees every data and index block of `inode`.
	///
	/// The pointer slots of a short symbolic link hold the target bytes,
	/// not addresses; they are only cleared.
	fn free_content(&mut self, inode: &mut Inode) -> EResult<()> {
		if inode.file_type() == FileType::Link && inode.size <= SYMLINK_INLINE_LIMIT {
			inode.direct = [0; SLOT_COUNT];
			return Ok(());
		}
		self.shrink(inode, 0)
	}

	/// Commits the transaction.
	fn commit(mut self) -> EResult<()> {
		self.finish()
	}

	/// Drops the transaction without committing anything.
	///
	/// The in-memory bitmaps are re-read from disk to discard the
	/// allocations made under this transaction.
	fn discard(mut self) {
		self.done = true;
		self.tx.clear();
		if self.bitmaps_dirty {
			let fs = &mut *self.fs;
			if let Err(e) = fs.inode_bitmap.reload(&fs.dev) {
				error!("discard: inode bitmap reload failed: {e}");
			}
			if let Err(e) = fs.block_bitmap.reload(&fs.dev) {
				error!("discard: block bitmap reload failed: {e}");
			}
		}
	}

	fn finish(&mut self) -> EResult<()> {
		if self.done {
			return Ok(());
		}
		self.done = true;
		if self.bitmaps_dirty {
			self.fs
				.inode_bitmap
				.flush(&mut self.tx, BlockKind::InodeBitmap);
			self.fs
				.block_bitmap
				.flush(&mut self.tx, BlockKind::BlockBitmap);
		}
		let fs = &mut *self.fs;
		fs.journal.commit(&fs.dev, &fs.cache, &mut self.tx)
	}
}

impl Drop for Tx<'_> {
	fn drop(&mut self) {
		if let Err(e) = self.finish() {
			error!("transaction {} commit failed: {e}", self.tx.tid());
		}
	}
}
