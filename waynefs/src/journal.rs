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

//! Write-ahead journal for metadata updates.
//!
//! The journal is a ring of log blocks inside the journal area. A committed
//! transaction occupies, contiguously in the ring:
//!
//! ```text
//! [ DESCRIPTOR ] [ data 1 ] ... [ data n ] [ COMMIT ]
//! ```
//!
//! The descriptor lists the final destination of every data block. Once the
//! commit record is durable, the staged blocks are checkpointed to their
//! final locations and the log space is reclaimed by advancing `head`.
//! Recovery at mount replays every committed transaction found between
//! `head` and `tail` and discards the rest.

use crate::cache::PageCache;
use crate::dev::BlockDev;
use crate::errno;
use crate::errno::EResult;
use crate::sb::Superblock;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Magic string of the journal superblock.
pub const JOURNAL_SB_MAGIC: &[u8; 16] = b"WAYNE_JOURNAL_SB";
/// Magic string of every log block header.
pub const JOURNAL_MAGIC: &[u8; 13] = b"WAYNE_JOURNAL";

/// Size of an encoded journal superblock, in bytes.
pub const JOURNAL_SB_SIZE: usize = 16 + 5 * 4;
/// Size of an encoded journal header, in bytes.
pub const JOURNAL_HEADER_SIZE: usize = 13 + 2 * 4;

/// Log block type: descriptor.
pub const BLOCK_TYPE_DESCRIPTOR: u32 = 1;
/// Log block type: metadata payload.
pub const BLOCK_TYPE_METADATA: u32 = 2;
/// Log block type: commit.
pub const BLOCK_TYPE_COMMIT: u32 = 3;

/// The kind of a staged metadata block, for tracing only. The on-disk log
/// does not record it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockKind {
	/// A block of the inode bitmap.
	InodeBitmap,
	/// A block of the block bitmap.
	BlockBitmap,
	/// A block of the inode table.
	InodeTable,
	/// A directory payload block.
	Directory,
	/// An index block of the indirect addressing graph.
	Indirect,
}

impl fmt::Display for BlockKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::InodeBitmap => "inode bitmap",
			Self::BlockBitmap => "block bitmap",
			Self::InodeTable => "inode table",
			Self::Directory => "directory",
			Self::Indirect => "indirect",
		};
		f.write_str(s)
	}
}

/// The journal superblock, stored in the first block of the journal area.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalSuperblock {
	/// First log block of the ring.
	pub start_block: u32,
	/// Capacity of the ring, in blocks.
	pub num_blocks: u32,
	/// Oldest un-checkpointed record.
	pub head: u32,
	/// Next write position.
	pub tail: u32,
	/// Identifier of the last committed transaction.
	pub last_tid: u32,
}

impl JournalSuperblock {
	/// Decodes the journal superblock, validating its magic.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		if raw.len() < JOURNAL_SB_SIZE || &raw[..16] != JOURNAL_SB_MAGIC {
			return Err(errno!(EUCLEAN));
		}
		let f = |i: usize| LittleEndian::read_u32(&raw[16 + i * 4..]);
		Ok(Self {
			start_block: f(0),
			num_blocks: f(1),
			head: f(2),
			tail: f(3),
			last_tid: f(4),
		})
	}

	/// Encodes the journal superblock.
	pub fn encode(&self) -> [u8; JOURNAL_SB_SIZE] {
		let mut raw = [0u8; JOURNAL_SB_SIZE];
		raw[..16].copy_from_slice(JOURNAL_SB_MAGIC);
		let fields = [
			self.start_block,
			self.num_blocks,
			self.head,
			self.tail,
			self.last_tid,
		];
		for (i, f) in fields.iter().enumerate() {
			LittleEndian::write_u32(&mut raw[16 + i * 4..16 + i * 4 + 4], *f);
		}
		raw
	}
}

/// The header beginning every log block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalHeader {
	/// One of the `BLOCK_TYPE_*` values.
	pub block_type: u32,
	/// Identifier of the transaction the block belongs to.
	pub tid: u32,
}

impl JournalHeader {
	/// Decodes a header, validating its magic.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		if raw.len() < JOURNAL_HEADER_SIZE || &raw[..13] != JOURNAL_MAGIC {
			return Err(errno!(EUCLEAN));
		}
		Ok(Self {
			block_type: LittleEndian::read_u32(&raw[13..]),
			tid: LittleEndian::read_u32(&raw[17..]),
		})
	}

	/// Writes the header at the beginning of `raw`.
	pub fn encode_into(&self, raw: &mut [u8]) {
		raw[..13].copy_from_slice(JOURNAL_MAGIC);
		LittleEndian::write_u32(&mut raw[13..17], self.block_type);
		LittleEndian::write_u32(&mut raw[17..21], self.tid);
	}
}

/// A descriptor record: the list of final destination addresses of the data
/// blocks that follow it in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DescriptorBlock {
	/// Identifier of the transaction.
	pub tid: u32,
	/// Destination addresses, in log order.
	pub addrs: Vec<u32>,
}

impl DescriptorBlock {
	/// Encodes the record, padded to `block_size`.
	pub fn encode(&self, block_size: u32) -> Vec<u8> {
		let mut raw = vec![0u8; block_size as usize];
		JournalHeader {
			block_type: BLOCK_TYPE_DESCRIPTOR,
			tid: self.tid,
		}
		.encode_into(&mut raw);
		let mut off = JOURNAL_HEADER_SIZE;
		LittleEndian::write_u32(&mut raw[off..off + 4], self.addrs.len() as u32);
		off += 4;
		for addr in &self.addrs {
			LittleEndian::write_u32(&mut raw[off..off + 4], *addr);
			off += 4;
		}
		raw
	}

	/// Decodes a descriptor record.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		let header = JournalHeader::decode(raw)?;
		if header.block_type != BLOCK_TYPE_DESCRIPTOR {
			return Err(errno!(EUCLEAN));
		}
		let mut off = JOURNAL_HEADER_SIZE;
		if raw.len() < off + 4 {
			return Err(errno!(EUCLEAN));
		}
		let n = LittleEndian::read_u32(&raw[off..]) as usize;
		off += 4;
		if raw.len() < off + n * 4 {
			return Err(errno!(EUCLEAN));
		}
		let addrs = (0..n)
			.map(|i| LittleEndian::read_u32(&raw[off + i * 4..]))
			.collect();
		Ok(Self {
			tid: header.tid,
			addrs,
		})
	}
}

/// A commit record: its presence makes the transaction durable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitBlock {
	/// Identifier of the transaction.
	pub tid: u32,
}

impl CommitBlock {
	/// Encodes the record, padded to `block_size`.
	pub fn encode(&self, block_size: u32) -> Vec<u8> {
		let mut raw = vec![0u8; block_size as usize];
		JournalHeader {
			block_type: BLOCK_TYPE_COMMIT,
			tid: self.tid,
		}
		.encode_into(&mut raw);
		raw
	}

	/// Decodes a commit record.
	pub fn decode(raw: &[u8]) -> EResult<Self> {
		let header = JournalHeader::decode(raw)?;
		if header.block_type != BLOCK_TYPE_COMMIT {
			return Err(errno!(EUCLEAN));
		}
		Ok(Self {
			tid: header.tid,
		})
	}
}

/// A staged metadata write.
struct StagedWrite {
	/// Final destination address.
	addr: u32,
	/// Kind, for tracing.
	kind: BlockKind,
	/// The full block image to write.
	data: Vec<u8>,
}

/// A staging buffer collecting the metadata writes of one operation.
///
/// Writes are kept in insertion order; a second write to the same address
/// overwrites the staged bytes in place. The transaction commits when its
/// owning scope ends (see `Tx` in the `fs` module) and commits nothing if
/// the staging buffer is empty.
pub struct Transaction {
	tid: u32,
	block_size: u32,
	writes: Vec<StagedWrite>,
	/// Data blocks that must reach the device before the descriptor.
	ordered: BTreeSet<u32>,
}

impl Transaction {
	fn new(tid: u32, block_size: u32) -> Self {
		Self {
			tid,
			block_size,
			writes: Vec::new(),
			ordered: BTreeSet::new(),
		}
	}

	/// Returns the transaction identifier.
	pub fn tid(&self) -> u32 {
		self.tid
	}

	/// Stages a metadata write of the full block `data` to `addr`.
	///
	/// `data` must be exactly one block long. A previous write to the same
	/// address within this transaction is overwritten.
	pub fn write(&mut self, addr: u32, data: Vec<u8>, kind: BlockKind) {
		debug_assert_eq!(data.len(), self.block_size as usize);
		debug!("tx {}: staging {} block {addr}", self.tid, kind);
		if let Some(w) = self.writes.iter_mut().find(|w| w.addr == addr) {
			w.data = data;
			w.kind = kind;
			return;
		}
		self.writes.push(StagedWrite {
			addr,
			kind,
			data,
		});
	}

	/// Registers `addr` as an ordered-data dependency: if the block is dirty
	/// in the page cache at commit, it is flushed before the descriptor is
	/// written.
	pub fn add_ordered(&mut self, addr: u32) {
		self.ordered.insert(addr);
	}

	/// Returns the staged bytes for `addr`, if any.
	pub fn staged(&self, addr: u32) -> Option<&[u8]> {
		self.writes
			.iter()
			.find(|w| w.addr == addr)
			.map(|w| w.data.as_slice())
	}

	/// Tells whether the staging buffer is empty.
	pub fn is_empty(&self) -> bool {
		self.writes.is_empty()
	}

	/// Drops every staged write and ordered dependency.
	///
	/// A cleared transaction commits nothing.
	pub fn clear(&mut self) {
		self.writes.clear();
		self.ordered.clear();
	}
}

/// The journal state, including its on-disk superblock.
pub struct Journal {
	sb: JournalSuperblock,
	/// Block address of the journal superblock.
	sb_addr: u32,
	block_size: u32,
	next_tid: u32,
}

impl Journal {
	/// Loads the journal superblock from the journal area described by `sb`.
	///
	/// A bad magic fails the mount.
	pub fn open(dev: &BlockDev, sb: &Superblock) -> EResult<Self> {
		let raw = dev.read_block(sb.journal_area_start)?;
		let jsb = JournalSuperblock::decode(&raw)?;
		// `head` and `tail` always point into the ring
		let ring = jsb.start_block..jsb.start_block + jsb.num_blocks;
		if jsb.num_blocks == 0 || !ring.contains(&jsb.head) || !ring.contains(&jsb.tail) {
			return Err(errno!(EUCLEAN));
		}
		let next_tid = jsb.last_tid + 1;
		Ok(Self {
			sb: jsb,
			sb_addr: sb.journal_area_start,
			block_size: sb.block_size,
			next_tid,
		})
	}

	/// Returns the journal superblock.
	pub fn superblock(&self) -> &JournalSuperblock {
		&self.sb
	}

	/// Begins a new transaction.
	pub fn begin(&mut self) -> Transaction {
		let tid = self.next_tid;
		self.next_tid += 1;
		debug!("tx {tid}: begin");
		Transaction::new(tid, self.block_size)
	}

	/// Returns the log slot following `cur` in the ring.
	fn next_slot(&self, cur: u32) -> u32 {
		let rel = (cur - self.sb.start_block + 1) % self.sb.num_blocks;
		self.sb.start_block + rel
	}

	fn write_sb(&self, dev: &BlockDev) -> EResult<()> {
		let mut raw = vec![0u8; self.block_size as usize];
		raw[..JOURNAL_SB_SIZE].copy_from_slice(&self.sb.encode());
		dev.write_block(self.sb_addr, &raw)
	}

	/// Commits `tx`: flushes its ordered-data dependencies, writes the log
	/// records, then checkpoints the staged blocks to their final locations.
	///
	/// An empty transaction only flushes its ordered-data dependencies and
	/// emits no record.
	pub fn commit(
		&mut self,
		dev: &BlockDev,
		cache: &PageCache,
		tx: &mut Transaction,
	) -> EResult<()> {
		// Data before metadata
		if !tx.ordered.is_empty() {
			let mut flushed = false;
			for addr in &tx.ordered {
				flushed |= cache.flush_block(dev, *addr)?;
			}
			if flushed {
				dev.fsync()?;
			}
		}
		if tx.is_empty() {
			return Ok(());
		}
		// The ring must fit the descriptor, the data blocks and the commit
		// record, and `tail` may never catch up with `head`
		let needed = tx.writes.len() as u32 + 2;
		if needed > self.sb.num_blocks - 1 {
			error!(
				"journal: transaction {} needs {needed} log blocks, ring holds {}",
				tx.tid, self.sb.num_blocks
			);
			return Err(errno!(EOVERFLOW));
		}
		// Descriptor
		let mut slot = self.sb.tail;
		let desc = DescriptorBlock {
			tid: tx.tid,
			addrs: tx.writes.iter().map(|w| w.addr).collect(),
		};
		dev.write_block(slot, &desc.encode(self.block_size))?;
		// Data blocks, in staging order
		for w in &tx.writes {
			slot = self.next_slot(slot);
			dev.write_block(slot, &w.data)?;
		}
		// Commit record
		slot = self.next_slot(slot);
		let commit = CommitBlock {
			tid: tx.tid,
		};
		dev.write_block(slot, &commit.encode(self.block_size))?;
		dev.fsync()?;
		// The transaction is durable: advance the tail
		self.sb.tail = self.next_slot(slot);
		self.sb.last_tid = tx.tid;
		self.write_sb(dev)?;
		debug!(
			"tx {}: committed, {} block(s), tail={}",
			tx.tid,
			tx.writes.len(),
			self.sb.tail
		);
		// Checkpoint: write the staged blocks to their final destinations,
		// keeping the page cache in sync
		for w in &tx.writes {
			dev.write_block(w.addr, &w.data)?;
			cache.put(w.addr, w.data.clone());
		}
		dev.fsync()?;
		// Reclaim the log space
		self.sb.head = self.sb.tail;
		self.write_sb(dev)?;
		debug!("tx {}: checkpointed", tx.tid);
		Ok(())
	}

	/// Replays the log, restoring consistency after a crash.
	///
	/// Runs at mount, before any operation. Transactions whose commit record
	/// is present are written to their final destinations; anything else is
	/// discarded. Corruption stops the scan. The function is idempotent.
	pub fn recover(&mut self, dev: &BlockDev) -> EResult<()> {
		if self.sb.head == self.sb.tail {
			debug!("journal: clean, no recovery needed");
			return Ok(());
		}
		debug!(
			"journal: recovering, head={} tail={}",
			self.sb.head, self.sb.tail
		);
		let mut pending: BTreeMap<u32, Vec<(u32, Vec<u8>)>> = BTreeMap::new();
		let mut cur = self.sb.head;
		let mut replayed = false;
		while cur != self.sb.tail {
			let Ok(raw) = dev.read_block(cur) else {
				break;
			};
			let Ok(header) = JournalHeader::decode(&raw) else {
				// Corruption stops the scan
				debug!("journal: bad header at {cur}, stopping scan");
				break;
			};
			match header.block_type {
				BLOCK_TYPE_DESCRIPTOR => {
					let Ok(desc) = DescriptorBlock::decode(&raw) else {
						break;
					};
					// Buffer the data blocks for this transaction
					let mut blocks = Vec::with_capacity(desc.addrs.len());
					let mut ok = true;
					for addr in &desc.addrs {
						cur = self.next_slot(cur);
						if cur == self.sb.tail {
							ok = false;
							break;
						}
						let Ok(data) = dev.read_block(cur) else {
							ok = false;
							break;
						};
						blocks.push((*addr, data));
					}
					if !ok {
						break;
					}
					pending.insert(desc.tid, blocks);
				}
				BLOCK_TYPE_COMMIT => {
					if let Some(blocks) = pending.remove(&header.tid) {
						debug!(
							"journal: replaying tx {} ({} block(s))",
							header.tid,
							blocks.len()
						);
						for (addr, data) in &blocks {
							dev.write_block(*addr, data)?;
						}
						replayed = true;
						self.sb.head = self.next_slot(cur);
					}
				}
				_ => {
					// Not part of a committed transaction: drop its buffer
					pending.remove(&header.tid);
				}
			}
			cur = self.next_slot(cur);
		}
		if replayed {
			dev.fsync()?;
		}
		// Clean the log
		self.sb.head = self.sb.tail;
		self.write_sb(dev)?;
		dev.fsync()?;
		debug!("journal: recovery done, head=tail={}", self.sb.head);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn superblock_codec() {
		let sb = JournalSuperblock {
			start_block: 12,
			num_blocks: 9,
			head: 14,
			tail: 14,
			last_tid: 7,
		};
		let raw = sb.encode();
		assert_eq!(&raw[..16], JOURNAL_SB_MAGIC);
		assert_eq!(JournalSuperblock::decode(&raw).unwrap(), sb);
		let mut bad = raw;
		bad[0] = b'x';
		assert!(JournalSuperblock::decode(&bad).is_err());
	}

	#[test]
	fn header_codec() {
		let header = JournalHeader {
			block_type: BLOCK_TYPE_COMMIT,
			tid: 42,
		};
		let mut raw = vec![0u8; 64];
		header.encode_into(&mut raw);
		assert_eq!(JournalHeader::decode(&raw).unwrap(), header);
	}

	#[test]
	fn descriptor_codec() {
		let desc = DescriptorBlock {
			tid: 3,
			addrs: vec![100, 200, 300],
		};
		let raw = desc.encode(4096);
		assert_eq!(raw.len(), 4096);
		assert_eq!(DescriptorBlock::decode(&raw).unwrap(), desc);
		// a commit record is not a descriptor
		let commit = CommitBlock {
			tid: 3,
		}
		.encode(4096);
		assert!(DescriptorBlock::decode(&commit).is_err());
	}

	#[test]
	fn staging_overwrites_same_address() {
		let mut tx = Transaction::new(1, 16);
		tx.write(5, vec![1u8; 16], BlockKind::InodeTable);
		tx.write(6, vec![2u8; 16], BlockKind::Directory);
		tx.write(5, vec![3u8; 16], BlockKind::InodeTable);
		assert_eq!(tx.staged(5), Some(&[3u8; 16][..]));
		// insertion order is preserved
		let addrs: Vec<u32> = tx.writes.iter().map(|w| w.addr).collect();
		assert_eq!(addrs, vec![5, 6]);
	}
}
