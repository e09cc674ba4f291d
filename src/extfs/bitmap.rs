use log::trace;

use super::fs::ExtFilesystem;
use super::kernel::Errno;
use super::structs::{Inode, SuperBlock};

pub const FREE: u8 = b'0';
pub const USED: u8 = b'1';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitmap {
  Inodes,
  Blocks,
}

impl ExtFilesystem {
  fn bitmap_region(&self, bitmap: Bitmap) -> (i64, i64) {
    let superblock = &self.superblock;
    match bitmap {
      Bitmap::Inodes => (superblock.bm_inode_start, superblock.inodes_count),
      Bitmap::Blocks => (superblock.bm_block_start, superblock.blocks_count),
    }
  }

  pub fn read_bitmap(&mut self, bitmap: Bitmap) -> Result<Vec<u8>, Errno> {
    let (start, count) = self.bitmap_region(bitmap);
    self.device.read_at(start, count as usize)
  }

  pub fn is_used(&mut self, bitmap: Bitmap, index: i64) -> Result<bool, Errno> {
    let (start, count) = self.bitmap_region(bitmap);
    if index < 0 || index >= count {
      return Ok(false);
    }
    Ok(self.device.read_at(start + index, 1)?[0] == USED)
  }

  /// Smallest free index at or after the hint; the byte is flipped and the
  /// superblock persisted before the caller writes the record.
  fn alloc(&mut self, bitmap: Bitmap) -> Result<i64, Errno> {
    let (start, count) = self.bitmap_region(bitmap);
    let bytes = self.read_bitmap(bitmap)?;
    let hint = match bitmap {
      Bitmap::Inodes => self.superblock.first_free_inode,
      Bitmap::Blocks => self.superblock.first_free_block,
    }
    .clamp(0, count) as usize;

    let index = bytes[hint..]
      .iter()
      .position(|&byte| byte == FREE)
      .map(|offset| offset + hint)
      .or_else(|| bytes[..hint].iter().position(|&byte| byte == FREE))
      .ok_or_else(|| match bitmap {
        Bitmap::Inodes => Errno::ENOSPC(String::from("no free inodes")),
        Bitmap::Blocks => Errno::ENOSPC(String::from("no free blocks")),
      })?;

    self.device.write_at(start + index as i64, &[USED])?;
    let next_free = bytes[index + 1..]
      .iter()
      .position(|&byte| byte == FREE)
      .map(|offset| (offset + index + 1) as i64)
      .unwrap_or(count);

    let superblock = &mut self.superblock;
    match bitmap {
      Bitmap::Inodes => {
        superblock.free_inodes_count -= 1;
        superblock.first_free_inode = next_free;
      }
      Bitmap::Blocks => {
        superblock.free_blocks_count -= 1;
        superblock.first_free_block = next_free;
      }
    }
    self.write_superblock()?;
    trace!("alloc {bitmap:?} #{index}");
    Ok(index as i64)
  }

  fn free(&mut self, bitmap: Bitmap, index: i64) -> Result<(), Errno> {
    let (start, count) = self.bitmap_region(bitmap);
    if index < 0 || index >= count {
      return Err(Errno::EUCLEAN(format!("{bitmap:?} index {index} out of range")));
    }
    if !self.is_used(bitmap, index)? {
      return Err(Errno::EUCLEAN(format!("{bitmap:?} #{index} freed twice")));
    }
    self.device.write_at(start + index, &[FREE])?;

    let superblock = &mut self.superblock;
    match bitmap {
      Bitmap::Inodes => {
        superblock.free_inodes_count += 1;
        superblock.first_free_inode = superblock.first_free_inode.min(index);
      }
      Bitmap::Blocks => {
        superblock.free_blocks_count += 1;
        superblock.first_free_block = superblock.first_free_block.min(index);
      }
    }
    self.write_superblock()?;
    trace!("free {bitmap:?} #{index}");
    Ok(())
  }

  pub fn alloc_inode(&mut self) -> Result<i64, Errno> {
    self.alloc(Bitmap::Inodes)
  }

  pub fn alloc_block(&mut self) -> Result<i64, Errno> {
    self.alloc(Bitmap::Blocks)
  }

  /// Free an inode and wipe its record.
  pub fn free_inode(&mut self, index: i64) -> Result<(), Errno> {
    self.free(Bitmap::Inodes, index)?;
    let offset = self.superblock.inode_offset(index);
    self.device.zero_range(offset, self.superblock.inode_size)
  }

  pub fn free_block(&mut self, index: i64) -> Result<(), Errno> {
    self.free(Bitmap::Blocks, index)?;
    let offset = self.superblock.block_offset(index);
    self.device.zero_range(offset, self.superblock.block_size)
  }

  pub fn write_superblock(&mut self) -> Result<(), Errno> {
    let start = self.start;
    let superblock: SuperBlock = self.superblock.clone();
    self.device.write_record(start, &superblock)
  }

  pub(super) fn used_inodes(&mut self) -> Result<Vec<(i64, Inode)>, Errno> {
    let bytes = self.read_bitmap(Bitmap::Inodes)?;
    let mut inodes = Vec::new();
    for (index, byte) in bytes.into_iter().enumerate() {
      if byte == USED {
        inodes.push((index as i64, self.read_inode(index as i64)?));
      }
    }
    Ok(inodes)
  }
}


// vim:ts=2 sw=2
