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

//! Directory payload codec.
//!
//! A directory's content is a single block: a `u32` header holding the
//! payload length, then entries packed back to back, each being the inode
//! number, the name length and the raw UTF-8 name. Entries preserve
//! insertion order.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the payload header, in bytes.
pub const HEADER_SIZE: usize = 4;
/// Size of an entry's fixed part: inode number and name length.
pub const ENTRY_HEADER_SIZE: usize = 6;

/// A directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
	/// The inode the entry points to.
	pub ino: u32,
	/// The name of the entry.
	pub name: String,
}

impl DirEntry {
	/// Creates an entry.
	pub fn new(ino: u32, name: impl Into<String>) -> Self {
		Self {
			ino,
			name: name.into(),
		}
	}
}

/// Returns the encoded size of `entries`, header included.
pub fn packed_size(entries: &[DirEntry]) -> usize {
	HEADER_SIZE
		+ entries
			.iter()
			.map(|e| ENTRY_HEADER_SIZE + e.name.len())
			.sum::<usize>()
}

/// Packs `entries` into a directory payload.
pub fn pack(entries: &[DirEntry]) -> Vec<u8> {
	let mut data = vec![0u8; HEADER_SIZE];
	for ent in entries {
		let name = ent.name.as_bytes();
		let mut head = [0u8; ENTRY_HEADER_SIZE];
		LittleEndian::write_u32(&mut head[0..], ent.ino);
		LittleEndian::write_u16(&mut head[4..], name.len() as u16);
		data.extend_from_slice(&head);
		data.extend_from_slice(name);
	}
	let len = (data.len() - HEADER_SIZE) as u32;
	LittleEndian::write_u32(&mut data[..HEADER_SIZE], len);
	data
}

/// Unpacks a directory payload.
///
/// The view is truncated to the length announced by the header; a short
/// entry terminates the walk. Names are raw UTF-8 and are not normalized;
/// an entry whose name is not valid UTF-8 also terminates the walk.
pub fn unpack(raw: &[u8]) -> Vec<DirEntry> {
	let mut out = Vec::new();
	if raw.len() < HEADER_SIZE {
		return out;
	}
	let total_len = LittleEndian::read_u32(&raw[..HEADER_SIZE]) as usize;
	let end = (HEADER_SIZE + total_len).min(raw.len());
	let data = &raw[HEADER_SIZE..end];
	let mut off = 0;
	while off + ENTRY_HEADER_SIZE <= data.len() {
		let ino = LittleEndian::read_u32(&data[off..]);
		let name_len = LittleEndian::read_u16(&data[off + 4..]) as usize;
		let name_off = off + ENTRY_HEADER_SIZE;
		if name_off + name_len > data.len() {
			break;
		}
		let Ok(name) = std::str::from_utf8(&data[name_off..name_off + name_len]) else {
			break;
		};
		out.push(DirEntry::new(ino, name));
		off = name_off + name_len;
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn roundtrip() {
		let entries = vec![
			DirEntry::new(0, "."),
			DirEntry::new(0, ".."),
			DirEntry::new(3, "hello.txt"),
		];
		let raw = pack(&entries);
		assert_eq!(raw.len(), packed_size(&entries));
		assert_eq!(unpack(&raw), entries);
	}

	#[test]
	fn empty_payload() {
		assert_eq!(unpack(&pack(&[])), vec![]);
		assert_eq!(unpack(&[]), vec![]);
		assert_eq!(unpack(&[0u8; 2]), vec![]);
	}

	#[test]
	fn preserves_order() {
		let entries = vec![
			DirEntry::new(9, "z"),
			DirEntry::new(1, "a"),
			DirEntry::new(5, "m"),
		];
		assert_eq!(unpack(&pack(&entries)), entries);
	}

	#[test]
	fn truncated_entry_terminates() {
		let entries = vec![DirEntry::new(1, "abcdef")];
		let mut raw = pack(&entries);
		// announce more bytes than present
		LittleEndian::write_u32(&mut raw[..4], 100);
		assert_eq!(unpack(&raw), entries);
	}

	#[test]
	fn padded_block_ignores_tail() {
		let entries = vec![DirEntry::new(2, "dir")];
		let mut raw = pack(&entries);
		raw.resize(4096, 0);
		assert_eq!(unpack(&raw), entries);
	}
}
