use log::info;

use super::codec::Record;
use super::device::BlockDevice;
use super::fs::{ExtFilesystem, ROOT_INODE};
use super::kernel::Errno;
use super::mount::MountedPartition;
use super::perms::{Credentials, ROOT_GID, ROOT_UID};
use super::structs::{
  FolderBlock, Inode, JournalEntry, SuperBlock, BLOCK_SIZE, INODE_FILE, INODE_FOLDER, JOURNAL_CAPACITY, MAGIC,
};
use super::users::{USERS_FILE, USERS_DEFAULT};
use crate::util::unixtime;

/// Bytes of the journal area on an ext3 partition.
pub const JOURNAL_BYTES: i64 = JOURNAL_CAPACITY * JournalEntry::SIZE as i64;

/// Parse `2fs`/`3fs` (also `ext2`/`ext3`).
pub fn parse_fs_type(fs: &str) -> Result<i64, Errno> {
  match fs.to_ascii_lowercase().as_str() {
    "2fs" | "ext2" => Ok(2),
    "3fs" | "ext3" => Ok(3),
    _ => Err(Errno::EINVAL(format!("invalid filesystem '{fs}': expected 2fs or 3fs"))),
  }
}

/// Region offsets and counts for a partition of `size` bytes at `start`.
pub fn layout(start: i64, size: i64, fs_type: i64) -> Result<SuperBlock, Errno> {
  let journal = if fs_type == 3 { JOURNAL_BYTES } else { 0 };
  let inode_size = Inode::SIZE as i64;
  let free = size - SuperBlock::SIZE as i64 - journal;
  let n = free.max(0) / (1 + 3 + inode_size + 3 * BLOCK_SIZE);
  if n < 2 {
    return Err(Errno::ENOSPC(format!("partition of {size} bytes is too small for ext{fs_type}")));
  }

  let bm_inode_start = start + SuperBlock::SIZE as i64 + journal;
  let bm_block_start = bm_inode_start + n;
  let inode_start = bm_block_start + 3 * n;
  let block_start = inode_start + n * inode_size;

  Ok(SuperBlock {
    fs_type,
    inodes_count: n,
    blocks_count: 3 * n,
    free_blocks_count: 3 * n,
    free_inodes_count: n,
    mtime: unixtime(),
    umtime: 0,
    mnt_count: 1,
    magic: MAGIC,
    inode_size,
    block_size: BLOCK_SIZE,
    first_free_inode: 0,
    first_free_block: 0,
    bm_inode_start,
    bm_block_start,
    inode_start,
    block_start,
  })
}

/// Format `size` bytes at `start` of `device`.
pub fn mkfs_at(mut device: BlockDevice, start: i64, size: i64, fs_type: i64) -> Result<ExtFilesystem, Errno> {
  if fs_type != 2 && fs_type != 3 {
    return Err(Errno::EINVAL(format!("unsupported filesystem type {fs_type}")));
  }
  let superblock = layout(start, size, fs_type)?;

  device.zero_range(start, size)?;
  device.write_record(start, &superblock)?;
  let mut fs = ExtFilesystem::load(device, start, size)?;
  fs.populate()?;
  fs.device.flush()?;

  info!(
    "mkfs: ext{fs_type} at {start}: {} inodes, {} blocks",
    fs.superblock.inodes_count, fs.superblock.blocks_count
  );
  Ok(fs)
}

pub fn mkfs(mounted: &MountedPartition, fs_type: i64) -> Result<ExtFilesystem, Errno> {
  let device = BlockDevice::open(&mounted.path, true)?;
  mkfs_at(device, mounted.start, mounted.size, fs_type)
}

impl ExtFilesystem {
  /// Fresh bitmaps, root folder and users.txt over the current layout.
  fn populate(&mut self) -> Result<(), Errno> {
    let superblock = &self.superblock;
    let (bm_inode_start, inodes) = (superblock.bm_inode_start, superblock.inodes_count);
    let (bm_block_start, blocks) = (superblock.bm_block_start, superblock.blocks_count);
    self.device.write_at(bm_inode_start, &vec![b'0'; inodes as usize])?;
    self.device.write_at(bm_block_start, &vec![b'0'; blocks as usize])?;

    let index = self.alloc_inode()?;
    let block = self.alloc_block()?;
    if index != ROOT_INODE {
      return Err(Errno::EUCLEAN(format!("root landed on inode #{index}")));
    }
    let mut root = Inode::new(INODE_FOLDER, ROOT_UID, ROOT_GID, *b"777", unixtime());
    root.block[0] = block;
    self.write_block(block, &FolderBlock::with_links(ROOT_INODE, ROOT_INODE))?;
    self.write_inode(ROOT_INODE, &root)?;

    self.create_node(
      &Credentials::root(),
      ROOT_INODE,
      &mut root,
      USERS_FILE,
      INODE_FILE,
      *b"664",
      USERS_DEFAULT.as_bytes(),
    )?;
    Ok(())
  }

  /// Wipe bitmaps, inodes and blocks and rebuild an empty tree, keeping the
  /// superblock layout and the journal.
  pub fn reformat(&mut self) -> Result<(), Errno> {
    let start = self.superblock.bm_inode_start;
    let end = self.superblock.end();
    self.device.zero_range(start, end - start)?;

    let superblock = &mut self.superblock;
    superblock.free_inodes_count = superblock.inodes_count;
    superblock.free_blocks_count = superblock.blocks_count;
    superblock.first_free_inode = 0;
    superblock.first_free_block = 0;
    self.write_superblock()?;
    self.populate()
  }

  /// Bytes a partition must keep to hold this filesystem.
  pub fn footprint(&self) -> i64 {
    self.superblock.end() - self.start
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extfs::bitmap::Bitmap;
  use crate::util::mktemp;

  #[test]
  fn layout_solves_for_n() {
    let superblock = layout(1000, 5 * 1024 * 1024, 3).unwrap();
    let n = (5 * 1024 * 1024 - 136 - 5700) / (4 + 164 + 3 * 96);
    assert_eq!(superblock.inodes_count, n);
    assert_eq!(superblock.blocks_count, 3 * n);
    assert_eq!(superblock.bm_inode_start, 1000 + 136 + 5700);
    assert_eq!(superblock.bm_block_start, superblock.bm_inode_start + n);
    assert_eq!(superblock.inode_start, superblock.bm_block_start + 3 * n);
    assert_eq!(superblock.block_start, superblock.inode_start + 164 * n);
    assert!(superblock.end() <= 1000 + 5 * 1024 * 1024);

    let ext2 = layout(0, 5 * 1024 * 1024, 2).unwrap();
    assert_eq!(ext2.bm_inode_start, 136);
    assert!(ext2.inodes_count > n);
  }

  #[test]
  fn layout_rejects_tiny_partitions() {
    assert!(matches!(layout(0, 600, 2), Err(Errno::ENOSPC(_))));
    assert!(matches!(layout(0, 4096, 3), Err(Errno::ENOSPC(_))));
  }

  #[test]
  fn fs_types() {
    assert_eq!(parse_fs_type("2fs").unwrap(), 2);
    assert_eq!(parse_fs_type("3FS").unwrap(), 3);
    assert!(parse_fs_type("4fs").is_err());
  }

  #[test]
  fn mkfs_writes_root_and_users() {
    let path = mktemp();
    let device = BlockDevice::create(&path, 5 * 1024 * 1024 + 512).unwrap();
    let mut fs = mkfs_at(device, 512, 5 * 1024 * 1024, 3).unwrap();

    let superblock = fs.superblock().clone();
    assert_eq!(superblock.magic, 0xEF53);
    assert_eq!(superblock.umtime, 0);
    assert_eq!(superblock.mnt_count, 1);
    assert_eq!(superblock.inode_size, 164);
    assert_eq!(superblock.free_inodes_count, superblock.inodes_count - 2);
    assert_eq!(superblock.free_blocks_count, superblock.blocks_count - 2);
    assert_eq!(superblock.first_free_inode, 2);
    assert_eq!(superblock.first_free_block, 2);

    let root = fs.root().unwrap();
    assert_eq!(&root.perm, b"777");
    assert_eq!((root.uid, root.gid), (1, 1));
    let entries = fs.entries(&root).unwrap();
    assert_eq!(entries[0], (String::from("."), 0));
    assert_eq!(entries[1], (String::from(".."), 0));
    assert_eq!(entries[2], (String::from("users.txt"), 1));

    let (_, users) = fs.resolve("/users.txt").unwrap();
    assert_eq!(&users.perm, b"664");
    assert_eq!(fs.read_content(&users).unwrap(), b"1,G,root\n1,U,root,root,123\n");
    assert!(fs.journal().unwrap().is_empty());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn reformat_keeps_layout() {
    let path = mktemp();
    let device = BlockDevice::create(&path, 256 * 1024).unwrap();
    let mut fs = mkfs_at(device, 0, 256 * 1024, 2).unwrap();
    fs.mkdir(&Credentials::root(), "/gone", false).unwrap();
    let before = fs.superblock().clone();

    fs.reformat().unwrap();
    assert!(matches!(fs.resolve("/gone"), Err(Errno::ENOENT(_))));
    assert_eq!(fs.superblock().inode_start, before.inode_start);
    assert_eq!(fs.superblock().free_inodes_count, before.inodes_count - 2);
    assert_eq!(&fs.read_bitmap(Bitmap::Inodes).unwrap()[..3], b"110");
    assert_eq!(fs.footprint(), before.end());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }
}

// vim:ts=2 sw=2
