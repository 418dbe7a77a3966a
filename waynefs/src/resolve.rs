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

//! Path resolution and the dentry cache.
//!
//! Resolution walks an absolute path segment by segment from the root
//! directory, following symbolic links of intermediate segments. The final
//! segment is never followed: operations that need the link target read it
//! themselves.

use crate::errno;
use crate::errno::EResult;
use crate::fs::WayneFs;
use crate::inode::{FileType, ROOT_INO};
use crate::limits::{NAME_MAX, SYMLOOP_MAX};
use std::collections::HashMap;
use std::collections::VecDeque;

/// A cache of resolved paths.
///
/// Entries are invalidated on every name-changing operation.
#[derive(Default)]
pub(crate) struct DentryCache {
	map: HashMap<String, u32>,
}

impl DentryCache {
	/// Returns the cached inode for `path`, if any.
	pub fn get(&self, path: &str) -> Option<u32> {
		self.map.get(path).copied()
	}

	/// Caches the resolution of `path`.
	pub fn put(&mut self, path: &str, ino: u32) {
		self.map.insert(path.to_owned(), ino);
	}

	/// Invalidates `path`.
	pub fn remove(&mut self, path: &str) {
		self.map.remove(path);
	}

	/// Invalidates `path` and every cached path beneath it.
	pub fn remove_prefix(&mut self, path: &str) {
		let prefix = format!("{}/", path.trim_end_matches('/'));
		self.map
			.retain(|p, _| p != path && !p.starts_with(&prefix));
	}
}

/// Splits `path` into its parent path and its final name.
///
/// The name may not be empty, `.` or `..`, and may not exceed
/// [`NAME_MAX`].
pub(crate) fn split_path(path: &str) -> EResult<(&str, &str)> {
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		// the root directory has no parent
		return Err(errno!(EINVAL));
	}
	let (parent, name) = match trimmed.rfind('/') {
		Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
		None => ("", trimmed),
	};
	let parent = if parent.is_empty() { "/" } else { parent };
	if name.is_empty() || name == "." || name == ".." {
		return Err(errno!(EINVAL));
	}
	if name.len() > NAME_MAX {
		return Err(errno!(ENAMETOOLONG));
	}
	Ok((parent, name))
}

impl WayneFs {
	/// Resolves an absolute `path` to an inode number.
	///
	/// Symbolic links are followed for intermediate segments only; the
	/// target path is spliced in place of the consumed segment, an absolute
	/// target restarting at the root. `..` re-reads the current directory's
	/// `..` entry and falls back to the root when it is absent.
	pub(crate) fn resolve(&mut self, path: &str) -> EResult<u32> {
		if path.is_empty() || path == "/" {
			return Ok(ROOT_INO);
		}
		if let Some(ino) = self.dcache.get(path) {
			return Ok(ino);
		}
		let mut segs: VecDeque<String> = path
			.split('/')
			.filter(|s| !s.is_empty() && *s != ".")
			.map(str::to_owned)
			.collect();
		let mut cur = ROOT_INO;
		let mut links_followed = 0;
		while let Some(seg) = segs.pop_front() {
			let inode = self.read_inode(cur)?;
			if inode.file_type() != FileType::Directory {
				return Err(errno!(ENOTDIR));
			}
			let entries = self.dir_entries(&inode)?;
			if seg == ".." {
				// At the filesystem root, `..` resolves to the root itself
				cur = entries
					.iter()
					.find(|e| e.name == "..")
					.map(|e| e.ino)
					.unwrap_or(ROOT_INO);
				continue;
			}
			let Some(next) = entries.iter().find(|e| e.name == seg) else {
				return Err(errno!(ENOENT));
			};
			let next = next.ino;
			if !segs.is_empty() {
				let next_inode = self.read_inode(next)?;
				if next_inode.file_type() == FileType::Link {
					links_followed += 1;
					if links_followed > SYMLOOP_MAX {
						return Err(errno!(ELOOP));
					}
					let target = self.link_target(&next_inode)?;
					if target.starts_with('/') {
						cur = ROOT_INO;
					}
					for t in target
						.split('/')
						.filter(|s| !s.is_empty() && *s != ".")
						.rev()
					{
						segs.push_front(t.to_owned());
					}
					continue;
				}
			}
			cur = next;
		}
		// Only cache the canonical spelling, so invalidation by name works
		if !path.ends_with('/') {
			self.dcache.put(path, cur);
		}
		Ok(cur)
	}
}
