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

//! Filesystem limits.

/// Maximum length of a file name, in bytes.
pub const NAME_MAX: usize = 255;
/// Maximum length of a path, in bytes.
pub const PATH_MAX: usize = 4096;
/// Maximum length of a symbolic link target, in bytes.
pub const SYMLINK_MAX: usize = PATH_MAX;
/// Maximum number of symbolic links followed during one path resolution.
pub const SYMLOOP_MAX: usize = 40;
