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

//! `mkwaynefs` formats an empty WayneFS image.

use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use waynefs::format::{make_image, FormatOpts};

#[derive(Parser)]
#[command(about = "Create an empty WayneFS image")]
struct Cli {
	/// Path of the image file to create
	#[arg(long, default_value = "waynefs.img")]
	image: PathBuf,

	/// Image size in MiB
	#[arg(long, default_value_t = 128)]
	size_mb: u32,

	/// Block size in bytes
	#[arg(long, default_value_t = 4096)]
	block_size: u32,

	/// Number of inodes
	#[arg(long, default_value_t = 1024)]
	inodes: u32,

	/// Journal area size in bytes
	#[arg(long, default_value_t = 10 * 4096)]
	journal_size: u32,
}

fn main() {
	let cli = Cli::parse();
	let opts = FormatOpts {
		size_mb: cli.size_mb,
		block_size: cli.block_size,
		inodes: cli.inodes,
		journal_size: cli.journal_size,
	};
	let sb = match make_image(&cli.image, &opts) {
		Ok(sb) => sb,
		Err(e) => {
			eprintln!("mkwaynefs: {}: {e}", cli.image.display());
			exit(1);
		}
	};
	println!("Created image: {}", cli.image.display());
	println!("{:=<50}", "");
	println!("{:22} | {:10} | {}", "Field", "Value", "Blocks");
	println!("{:-<50}", "");
	println!(
		"{:22} | {:<10} | {}",
		"inode_bitmap_start", sb.inode_bitmap_start, sb.inode_bitmap_blocks
	);
	println!(
		"{:22} | {:<10} | {}",
		"block_bitmap_start", sb.block_bitmap_start, sb.block_bitmap_blocks
	);
	println!(
		"{:22} | {:<10} | {}",
		"inode_table_start", sb.inode_table_start, sb.inode_table_blocks
	);
	println!(
		"{:22} | {:<10} | {}",
		"journal_area_start",
		sb.journal_area_start,
		sb.journal_area_blocks()
	);
	println!("{:22} | {:<10} | -", "data_start", sb.data_start);
	println!("{:=<50}", "");
}
