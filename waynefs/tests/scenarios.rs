//! End-to-end scenarios over a freshly formatted image.

mod common;

use common::fresh;
use std::collections::HashSet;
use waynefs::bitmap::Bitmap;
use waynefs::cache::PageCache;
use waynefs::dev::BlockDev;
use waynefs::inode::{
	InodeTable, DIRECT_COUNT, DOUBLE_INDIRECT_SLOT, SINGLE_INDIRECT_SLOT, SYMLINK_INLINE_LIMIT,
	S_IFDIR, S_IFLNK, S_IFMT,
};
use waynefs::sb::Superblock;
use waynefs::{FileType, WayneFs};

/// Checks the allocator invariants of the unmounted image at `path`: every
/// allocated inode has its bitmap bit set, every reachable block has its
/// bitmap bit set, and no bit is set for anything unreferenced.
fn check_consistency(path: &std::path::Path) {
	let mut dev = BlockDev::open(path).unwrap();
	let sb = Superblock::load(&dev).unwrap();
	dev.set_block_size(sb.block_size);
	let inode_bitmap = Bitmap::load(
		&dev,
		sb.inode_bitmap_start,
		sb.inode_bitmap_blocks,
		sb.inode_count,
	)
	.unwrap();
	let block_bitmap = Bitmap::load(
		&dev,
		sb.block_bitmap_start,
		sb.block_bitmap_blocks,
		sb.total_blocks,
	)
	.unwrap();
	let itable = InodeTable::new(&sb);
	let cache = PageCache::new();
	let ptrs = sb.ptrs_per_block() as usize;
	let read_ptrs = |addr: u32| -> Vec<u32> {
		let blk = dev.read_block(addr).unwrap();
		(0..ptrs)
			.map(|i| u32::from_le_bytes(blk[i * 4..i * 4 + 4].try_into().unwrap()))
			.collect()
	};
	// Blocks below the data region are permanently used
	let mut reachable: HashSet<u32> = (0..sb.data_start).collect();
	for ino in 0..sb.inode_count {
		let inode = itable.read(&dev, &cache, ino).unwrap();
		assert_eq!(
			!inode.is_free(),
			inode_bitmap.is_set(ino),
			"inode {ino} vs its bitmap bit"
		);
		if inode.is_free() {
			continue;
		}
		if inode.file_type() == FileType::Link && inode.size <= SYMLINK_INLINE_LIMIT {
			// inline target: the slots hold bytes, not addresses
			continue;
		}
		for slot in 0..DIRECT_COUNT {
			if inode.direct[slot] != 0 {
				reachable.insert(inode.direct[slot]);
			}
		}
		let single = inode.direct[SINGLE_INDIRECT_SLOT];
		if single != 0 {
			reachable.insert(single);
			for ptr in read_ptrs(single) {
				if ptr != 0 {
					reachable.insert(ptr);
				}
			}
		}
		let double = inode.direct[DOUBLE_INDIRECT_SLOT];
		if double != 0 {
			reachable.insert(double);
			for l1 in read_ptrs(double) {
				if l1 == 0 {
					continue;
				}
				reachable.insert(l1);
				for ptr in read_ptrs(l1) {
					if ptr != 0 {
						reachable.insert(ptr);
					}
				}
			}
		}
	}
	for addr in 0..sb.total_blocks {
		assert_eq!(
			block_bitmap.is_set(addr),
			reachable.contains(&addr),
			"block {addr} vs its bitmap bit"
		);
	}
}

#[test]
fn s1_write_survives_remount() {
	let (path, mut fs) = fresh("s1");
	fs.mkdir("/d", 0o755).unwrap();
	fs.create("/d/f", 0o644).unwrap();
	let ino = fs.getattr("/d/f").unwrap().ino;
	assert_eq!(fs.write(ino, b"hello", 0).unwrap(), 5);
	drop(fs);
	let mut fs = WayneFs::mount(&path).unwrap();
	let stat = fs.getattr("/d/f").unwrap();
	assert_eq!(stat.size, 5);
	assert_eq!(fs.read(stat.ino, 5, 0).unwrap(), b"hello");
	drop(fs);
	check_consistency(&path);
}

#[test]
fn s2_partial_block_write() {
	let (_path, mut fs) = fresh("s2");
	fs.create("/a", 0o644).unwrap();
	let ino = fs.getattr("/a").unwrap().ino;
	fs.write(ino, &[b'A'; 4096], 0).unwrap();
	fs.write(ino, b"Z", 4095).unwrap();
	assert_eq!(fs.read(ino, 1, 4095).unwrap(), b"Z");
	assert_eq!(fs.read(ino, 1, 4094).unwrap(), b"A");
	assert_eq!(fs.getattr("/a").unwrap().size, 4096);
}

#[test]
fn s3_symlink_inline_and_spilled() {
	let (path, mut fs) = fresh("s3");
	fs.symlink("/l", "/nonexistent").unwrap();
	assert_eq!(fs.readlink("/l").unwrap(), "/nonexistent");
	let stat = fs.getattr("/l").unwrap();
	assert_eq!(stat.mode & S_IFMT, S_IFLNK);
	assert_eq!(stat.size, "/nonexistent".len() as u64);
	// a 200-byte target spills to a data block
	let long = format!("/{}", "t".repeat(199));
	fs.symlink("/long", &long).unwrap();
	assert_eq!(fs.readlink("/long").unwrap(), long);
	assert_eq!(fs.getattr("/long").unwrap().size, 200);
	drop(fs);
	let mut fs = WayneFs::mount(&path).unwrap();
	assert_eq!(fs.readlink("/l").unwrap(), "/nonexistent");
	assert_eq!(fs.readlink("/long").unwrap(), long);
	drop(fs);
	check_consistency(&path);
}

#[test]
fn s4_hard_links() {
	let (path, mut fs) = fresh("s4");
	let before = fs.statfs().free_inodes;
	fs.create("/x", 0o644).unwrap();
	let ino = fs.getattr("/x").unwrap().ino;
	fs.write(ino, b"shared", 0).unwrap();
	fs.link("/y", "/x").unwrap();
	assert_eq!(fs.getattr("/x").unwrap().nlink, 2);
	assert_eq!(fs.getattr("/y").unwrap().ino, ino);
	fs.unlink("/x").unwrap();
	assert_eq!(fs.getattr("/y").unwrap().nlink, 1);
	assert_eq!(fs.read(ino, 6, 0).unwrap(), b"shared");
	assert!(fs.getattr("/x").is_err());
	fs.unlink("/y").unwrap();
	// the inode is free again
	assert_eq!(fs.statfs().free_inodes, before);
	drop(fs);
	check_consistency(&path);
}

#[test]
fn s6_truncate_grows_through_indirect() {
	let (path, mut fs) = fresh("s6");
	fs.create("/a", 0o644).unwrap();
	let ino = fs.getattr("/a").unwrap().ino;
	let free_before = fs.statfs().free_blocks;
	let len = 12 * 4096 + 1024;
	fs.truncate(ino, len).unwrap();
	assert_eq!(fs.getattr("/a").unwrap().size, len);
	assert_eq!(fs.read(ino, 1, len - 1).unwrap(), vec![0u8]);
	// 13 data blocks plus one single indirect index block
	assert_eq!(free_before - fs.statfs().free_blocks, 14);
	// shrinking back frees everything, index included
	fs.truncate(ino, 0).unwrap();
	assert_eq!(fs.statfs().free_blocks, free_before);
	drop(fs);
	check_consistency(&path);
}

#[test]
fn namespace_after_mkdir() {
	let (_path, mut fs) = fresh("namespace");
	fs.mkdir("/a", 0o755).unwrap();
	fs.mkdir("/a/b", 0o755).unwrap();
	let names: Vec<String> = fs
		.readdir("/a")
		.unwrap()
		.into_iter()
		.map(|e| e.name)
		.collect();
	assert!(names.contains(&"b".to_owned()));
	let stat = fs.getattr("/a/b").unwrap();
	assert_eq!(stat.mode & S_IFMT, S_IFDIR);
	assert_eq!(stat.nlink, 2);
	// /a gained a subdirectory
	assert_eq!(fs.getattr("/a").unwrap().nlink, 3);
	assert_eq!(fs.getattr("/").unwrap().nlink, 3);
}

#[test]
fn rename_within_and_across_directories() {
	let (path, mut fs) = fresh("rename");
	fs.mkdir("/a", 0o755).unwrap();
	fs.mkdir("/b", 0o755).unwrap();
	fs.create("/a/f", 0o644).unwrap();
	let ino = fs.getattr("/a/f").unwrap().ino;
	fs.write(ino, b"content", 0).unwrap();
	// same parent
	fs.rename("/a/f", "/a/g").unwrap();
	assert!(fs.getattr("/a/f").is_err());
	assert_eq!(fs.getattr("/a/g").unwrap().ino, ino);
	// across parents
	fs.rename("/a/g", "/b/h").unwrap();
	assert!(fs.getattr("/a/g").is_err());
	assert_eq!(fs.getattr("/b/h").unwrap().ino, ino);
	// onto an existing name: the victim is unlinked
	fs.create("/b/i", 0o644).unwrap();
	fs.rename("/b/h", "/b/i").unwrap();
	assert_eq!(fs.getattr("/b/i").unwrap().ino, ino);
	assert_eq!(fs.read(ino, 7, 0).unwrap(), b"content");
	drop(fs);
	check_consistency(&path);
}

#[test]
fn rename_moves_directory_and_rewrites_dotdot() {
	let (path, mut fs) = fresh("rename-dir");
	fs.mkdir("/a", 0o755).unwrap();
	fs.mkdir("/b", 0o755).unwrap();
	fs.mkdir("/a/d", 0o755).unwrap();
	assert_eq!(fs.getattr("/a").unwrap().nlink, 3);
	fs.rename("/a/d", "/b/d").unwrap();
	assert_eq!(fs.getattr("/a").unwrap().nlink, 2);
	assert_eq!(fs.getattr("/b").unwrap().nlink, 3);
	// `..` now points at /b
	let b = fs.getattr("/b").unwrap().ino;
	let dotdot = fs
		.readdir("/b/d")
		.unwrap()
		.into_iter()
		.find(|e| e.name == "..")
		.unwrap();
	assert_eq!(dotdot.ino, b);
	// moving a directory under itself is rejected
	fs.mkdir("/b/d/sub", 0o755).unwrap();
	assert!(fs.rename("/b/d", "/b/d/sub/x").is_err());
	drop(fs);
	check_consistency(&path);
}

#[test]
fn rmdir_semantics() {
	let (_path, mut fs) = fresh("rmdir");
	fs.mkdir("/d", 0o755).unwrap();
	fs.create("/d/f", 0o644).unwrap();
	assert_eq!(
		fs.rmdir("/d").unwrap_err(),
		waynefs::Errno::ENOTEMPTY
	);
	fs.unlink("/d/f").unwrap();
	fs.rmdir("/d").unwrap();
	assert!(fs.getattr("/d").is_err());
	assert_eq!(fs.rmdir("/").unwrap_err(), waynefs::Errno::EPERM);
	fs.create("/f", 0o644).unwrap();
	assert_eq!(fs.rmdir("/f").unwrap_err(), waynefs::Errno::ENOTDIR);
	fs.unlink("/f").unwrap();
}

#[test]
fn symlink_resolution_in_paths() {
	let (_path, mut fs) = fresh("symlink-walk");
	fs.mkdir("/target", 0o755).unwrap();
	fs.create("/target/f", 0o644).unwrap();
	fs.symlink("/l", "/target").unwrap();
	// intermediate segments follow the link
	let ino = fs.getattr("/l/f").unwrap().ino;
	assert_eq!(ino, fs.getattr("/target/f").unwrap().ino);
	// a link loop errors out
	fs.symlink("/loop", "/loop").unwrap();
	assert_eq!(
		fs.getattr("/loop/x").unwrap_err(),
		waynefs::Errno::ELOOP
	);
}

#[test]
fn sparse_reads_and_bounds() {
	let (_path, mut fs) = fresh("sparse");
	fs.create("/s", 0o644).unwrap();
	let ino = fs.getattr("/s").unwrap().ino;
	// write beyond the first block leaves a hole
	fs.write(ino, b"end", 3 * 4096).unwrap();
	assert_eq!(fs.getattr("/s").unwrap().size, 3 * 4096 + 3);
	assert_eq!(fs.read(ino, 4, 0).unwrap(), vec![0u8; 4]);
	assert_eq!(fs.read(ino, 3, 3 * 4096).unwrap(), b"end");
	// reads past the end clamp
	assert_eq!(fs.read(ino, 100, 3 * 4096 + 3).unwrap(), b"");
	// a write beyond the maximum file size is rejected
	let max = fs.superblock().max_file_blocks() * 4096;
	assert_eq!(
		fs.write(ino, b"x", max).unwrap_err(),
		waynefs::Errno::EFBIG
	);
}

#[test]
fn double_indirect_addressing() {
	let (path, mut fs) = fresh("double-indirect");
	fs.create("/big", 0o644).unwrap();
	let ino = fs.getattr("/big").unwrap().ino;
	// one block in each addressing tier, written sparsely
	let p = fs.superblock().ptrs_per_block() as u64;
	let tiers = [0u64, 9, 10, 10 + p - 1, 10 + p, 10 + p + p + 3];
	for (i, lb) in tiers.iter().enumerate() {
		let payload = vec![i as u8 + 1; 16];
		fs.write(ino, &payload, lb * 4096).unwrap();
	}
	for (i, lb) in tiers.iter().enumerate() {
		assert_eq!(
			fs.read(ino, 16, lb * 4096).unwrap(),
			vec![i as u8 + 1; 16],
			"tier block {lb}"
		);
	}
	// holes in between stay holes
	assert_eq!(fs.read(ino, 16, 5 * 4096).unwrap(), vec![0u8; 16]);
	drop(fs);
	check_consistency(&path);
}

#[test]
fn open_file_table() {
	let (_path, mut fs) = fresh("handles");
	let fh = fs.create("/f", 0o644).unwrap();
	let ino = fs.handle(fh).unwrap().ino;
	assert_eq!(ino, fs.getattr("/f").unwrap().ino);
	let fh2 = fs.open("/f", 0).unwrap();
	// handles are never reused
	assert!(fh2 > fh);
	// sequential I/O advances the handle's offset
	fs.write_handle(fh, b"abc").unwrap();
	fs.write_handle(fh, b"def").unwrap();
	assert_eq!(fs.read_handle(fh2, 4).unwrap(), b"abcd");
	assert_eq!(fs.read_handle(fh2, 4).unwrap(), b"ef");
	fs.release(fh).unwrap();
	assert_eq!(fs.release(fh).unwrap_err(), waynefs::Errno::EBADF);
	assert_eq!(fs.handle(fh).unwrap_err(), waynefs::Errno::EBADF);
	fs.release(fh2).unwrap();
	assert_eq!(fs.open("/d", 0).unwrap_err(), waynefs::Errno::ENOENT);
}

#[test]
fn chmod_and_utimens() {
	let (_path, mut fs) = fresh("attrs");
	fs.create("/f", 0o644).unwrap();
	fs.chmod("/f", 0o600).unwrap();
	let stat = fs.getattr("/f").unwrap();
	assert_eq!(stat.mode & 0o777, 0o600);
	assert_eq!(stat.mode & S_IFMT, waynefs::inode::S_IFREG);
	fs.utimens("/f", Some(1), Some(2)).unwrap();
	let stat = fs.getattr("/f").unwrap();
	assert_eq!(stat.atime, 1);
	assert_eq!(stat.mtime, 2);
}

#[test]
fn statfs_counts() {
	let (_path, mut fs) = fresh("statfs");
	let before = fs.statfs();
	assert_eq!(before.block_size, 4096);
	assert_eq!(before.total_inodes, 256);
	// the root inode is allocated
	assert_eq!(before.free_inodes, 255);
	fs.mkdir("/d", 0o755).unwrap();
	let after = fs.statfs();
	assert_eq!(after.free_inodes, 254);
	assert_eq!(after.free_blocks, before.free_blocks - 1);
}

#[test]
fn no_space_in_directory_block() {
	let (_path, mut fs) = fresh("dir-full");
	// each entry takes 6 bytes plus the name; a 4096-byte block fills up
	let mut made = 0;
	for i in 0..200 {
		let name = format!("/file-with-a-rather-long-name-{i:04}");
		match fs.create(&name, 0o644) {
			Ok(_) => made += 1,
			Err(e) => {
				assert_eq!(e, waynefs::Errno::ENOSPC);
				break;
			}
		}
	}
	assert!(made > 0 && made < 200);
	// the failed create leaked nothing
	let free = fs.statfs().free_inodes;
	assert_eq!(free, 255 - made);
}
