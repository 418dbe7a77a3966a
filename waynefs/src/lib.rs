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

//! WayneFS is a user-space, block-structured filesystem stored in a single
//! image file.
//!
//! The image is divided into a superblock, an inode bitmap, a block bitmap,
//! an inode table, a journal area and a data region. Metadata updates go
//! through a write-ahead journal which makes every operation atomic with
//! respect to crashes; recovery at mount replays committed transactions and
//! discards the rest.
//!
//! The [`WayneFs`](fs::WayneFs) type exposes the operations a host
//! FUSE-style dispatcher needs; [`format`] writes a fresh image.

pub mod bitmap;
pub mod cache;
pub mod dev;
pub mod dirent;
pub mod errno;
pub mod format;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod limits;
pub mod resolve;
pub mod sb;

pub use errno::{EResult, Errno};
pub use fs::{OpenFile, Statfs, WayneFs};
pub use inode::{FileType, Mode, Stat};
