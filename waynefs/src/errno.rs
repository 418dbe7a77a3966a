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

//! Errno-style error handling.
//!
//! Every fallible operation of the filesystem returns an [`EResult`], whose
//! error side is an [`Errno`] surfaced as-is to the host dispatcher.

use core::fmt;

/// An error, represented as a POSIX errno.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i32)]
pub enum Errno {
	/// A path segment is missing.
	ENOENT = libc::ENOENT,
	/// Creation over an existing name.
	EEXIST = libc::EEXIST,
	/// Directory operation on a non-directory.
	ENOTDIR = libc::ENOTDIR,
	/// `unlink` on a directory.
	EISDIR = libc::EISDIR,
	/// `rmdir` on a directory with extra entries.
	ENOTEMPTY = libc::ENOTEMPTY,
	/// Bitmap exhausted, or directory block overflow.
	ENOSPC = libc::ENOSPC,
	/// The file exceeds the maximum block count.
	EFBIG = libc::EFBIG,
	/// Unknown open handle.
	EBADF = libc::EBADF,
	/// Invalid argument, for example `readlink` on a non-link.
	EINVAL = libc::EINVAL,
	/// Forbidden operation, for example removing the root directory.
	EPERM = libc::EPERM,
	/// On-disk structure failed validation.
	EUCLEAN = libc::EUCLEAN,
	/// Device I/O failure.
	EIO = libc::EIO,
	/// A name exceeds [`crate::limits::NAME_MAX`].
	ENAMETOOLONG = libc::ENAMETOOLONG,
	/// Too many levels of symbolic links.
	ELOOP = libc::ELOOP,
	/// Arithmetic overflow on an offset.
	EOVERFLOW = libc::EOVERFLOW,
}

impl Errno {
	/// Returns the raw integer value of the errno.
	pub fn as_int(self) -> i32 {
		self as i32
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "errno {}: {:?}", self.as_int(), self)
	}
}

impl From<std::io::Error> for Errno {
	fn from(err: std::io::Error) -> Self {
		match err.raw_os_error() {
			Some(libc::ENOENT) => Self::ENOENT,
			Some(libc::ENOSPC) => Self::ENOSPC,
			Some(libc::EPERM) => Self::EPERM,
			_ => Self::EIO,
		}
	}
}

/// Result type alias for operations returning an [`Errno`].
pub type EResult<T> = Result<T, Errno>;

/// Builds an [`Errno`] from its POSIX name.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::Errno::$name
	};
}
