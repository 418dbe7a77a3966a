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

//! The page cache avoids unnecessary disk I/O by keeping recently used
//! blocks in memory.

use crate::dev::BlockDev;
use crate::errno::EResult;
use std::collections::HashMap;
use std::sync::Mutex;

/// A cached block, with its dirty flag.
struct CachedBlock {
	data: Vec<u8>,
	dirty: bool,
}

/// A block cache.
///
/// Entries are never evicted. The dirty flag is only used by the
/// ordered-data path of the journal: data blocks are written into the cache
/// and marked dirty, then flushed before the transaction's descriptor
/// reaches the log.
#[derive(Default)]
pub struct PageCache {
	blocks: Mutex<HashMap<u32, CachedBlock>>,
}

impl PageCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the block at address `addr`, reading it from `dev` on a miss.
	pub fn get(&self, dev: &BlockDev, addr: u32) -> EResult<Vec<u8>> {
		let mut blocks = self.blocks.lock().unwrap();
		if let Some(blk) = blocks.get(&addr) {
			return Ok(blk.data.clone());
		}
		let data = dev.read_block(addr)?;
		blocks.insert(
			addr,
			CachedBlock {
				data: data.clone(),
				dirty: false,
			},
		);
		Ok(data)
	}

	/// Replaces the cached copy of the block at `addr` and marks it clean.
	pub fn put(&self, addr: u32, data: Vec<u8>) {
		let mut blocks = self.blocks.lock().unwrap();
		blocks.insert(
			addr,
			CachedBlock {
				data,
				dirty: false,
			},
		);
	}

	/// Marks the block at `addr` dirty.
	///
	/// Does nothing if the block is not cached.
	pub fn mark_dirty(&self, addr: u32) {
		let mut blocks = self.blocks.lock().unwrap();
		if let Some(blk) = blocks.get_mut(&addr) {
			blk.dirty = true;
		}
	}

	/// Tells whether the block at `addr` is cached and dirty.
	pub fn is_dirty(&self, addr: u32) -> bool {
		let blocks = self.blocks.lock().unwrap();
		blocks.get(&addr).map(|b| b.dirty).unwrap_or(false)
	}

	/// Writes the block at `addr` back to `dev` if it is dirty, clearing the
	/// flag.
	///
	/// Returns `true` if a write was issued.
	pub fn flush_block(&self, dev: &BlockDev, addr: u32) -> EResult<bool> {
		let mut blocks = self.blocks.lock().unwrap();
		let Some(blk) = blocks.get_mut(&addr) else {
			return Ok(false);
		};
		if !blk.dirty {
			return Ok(false);
		}
		dev.write_block(addr, &blk.data)?;
		blk.dirty = false;
		Ok(true)
	}

	/// Writes every dirty block back to `dev`.
	pub fn flush(&self, dev: &BlockDev) -> EResult<()> {
		let mut blocks = self.blocks.lock().unwrap();
		for (addr, blk) in blocks.iter_mut() {
			if blk.dirty {
				dev.write_block(*addr, &blk.data)?;
				blk.dirty = false;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn dirty_tracking() {
		let cache = PageCache::new();
		cache.put(42, vec![0u8; 16]);
		assert!(!cache.is_dirty(42));
		cache.mark_dirty(42);
		assert!(cache.is_dirty(42));
		// marking an uncached block is a no-op
		cache.mark_dirty(43);
		assert!(!cache.is_dirty(43));
	}
}
