use super::codec::Record;
use super::fs::ExtFilesystem;
use super::kernel::Errno;
use super::structs::{FileBlock, Inode, PointerBlock, DIRECT_BLOCKS, FILE_BLOCK_DATA, NONE, POINTERS_PER_BLOCK};

const SINGLE: usize = POINTERS_PER_BLOCK;
const DOUBLE: usize = POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;
const TRIPLE: usize = DOUBLE * POINTERS_PER_BLOCK;

/// Logical blocks addressable by one inode.
pub const MAX_BLOCKS: usize = DIRECT_BLOCKS + SINGLE + DOUBLE + TRIPLE;
/// Largest file content in bytes.
pub const MAX_FILE_SIZE: usize = MAX_BLOCKS * FILE_BLOCK_DATA;

/// Inode slot plus the pointer-block indices leading to a logical block.
fn index_path(logical: usize) -> Result<(usize, Vec<usize>), Errno> {
  let mut rest = logical;
  if rest < DIRECT_BLOCKS {
    return Ok((rest, Vec::new()));
  }
  rest -= DIRECT_BLOCKS;
  if rest < SINGLE {
    return Ok((12, vec![rest]));
  }
  rest -= SINGLE;
  if rest < DOUBLE {
    return Ok((13, vec![rest / SINGLE, rest % SINGLE]));
  }
  rest -= DOUBLE;
  if rest < TRIPLE {
    return Ok((14, vec![rest / DOUBLE, (rest / SINGLE) % SINGLE, rest % SINGLE]));
  }
  Err(Errno::ENOSPC(format!("logical block {logical} beyond the largest file")))
}

impl ExtFilesystem {
  fn check_inode_index(&self, index: i64) -> Result<(), Errno> {
    if index < 0 || index >= self.superblock.inodes_count {
      return Err(Errno::EUCLEAN(format!("inode #{index} out of range")));
    }
    Ok(())
  }

  fn check_block_index(&self, index: i64) -> Result<(), Errno> {
    if index < 0 || index >= self.superblock.blocks_count {
      return Err(Errno::EUCLEAN(format!("block #{index} out of range")));
    }
    Ok(())
  }

  pub fn read_inode(&mut self, index: i64) -> Result<Inode, Errno> {
    self.check_inode_index(index)?;
    let offset = self.superblock.inode_offset(index);
    self.device.read_record(offset)
  }

  pub fn write_inode(&mut self, index: i64, inode: &Inode) -> Result<(), Errno> {
    self.check_inode_index(index)?;
    let offset = self.superblock.inode_offset(index);
    self.device.write_record(offset, inode)
  }

  pub fn read_block<T: Record>(&mut self, index: i64) -> Result<T, Errno> {
    self.check_block_index(index)?;
    let offset = self.superblock.block_offset(index);
    self.device.read_record(offset)
  }

  pub fn write_block<T: Record>(&mut self, index: i64, block: &T) -> Result<(), Errno> {
    self.check_block_index(index)?;
    let offset = self.superblock.block_offset(index);
    self.device.write_record(offset, block)
  }

  /// Physical block for `logical`, or `None` when it was never written.
  pub fn lookup_block(&mut self, inode: &Inode, logical: usize) -> Result<Option<i64>, Errno> {
    let (slot, path) = index_path(logical)?;
    let mut pointer = inode.block[slot];
    for index in path {
      if pointer == NONE {
        return Ok(None);
      }
      let block: PointerBlock = self.read_block(pointer)?;
      pointer = block.pointers[index];
    }
    Ok(if pointer == NONE { None } else { Some(pointer) })
  }

  /// Physical block for `logical`, materializing pointer blocks on the way.
  /// `inode` is updated in memory; the caller persists it.
  pub fn ensure_block(&mut self, inode: &mut Inode, logical: usize) -> Result<i64, Errno> {
    let (slot, path) = index_path(logical)?;
    if inode.block[slot] == NONE {
      let block = self.alloc_block()?;
      if !path.is_empty() {
        self.write_block(block, &PointerBlock::default())?;
      }
      inode.block[slot] = block;
    }

    let mut pointer = inode.block[slot];
    let depth = path.len();
    for (level, index) in path.into_iter().enumerate() {
      let mut parent: PointerBlock = self.read_block(pointer)?;
      if parent.pointers[index] == NONE {
        let child = self.alloc_block()?;
        if level + 1 < depth {
          self.write_block(child, &PointerBlock::default())?;
        }
        parent.pointers[index] = child;
        self.write_block(pointer, &parent)?;
      }
      pointer = parent.pointers[index];
    }
    Ok(pointer)
  }

  fn free_tree(&mut self, pointer: i64, depth: usize) -> Result<(), Errno> {
    if pointer == NONE {
      return Ok(());
    }
    if depth > 0 {
      let block: PointerBlock = self.read_block(pointer)?;
      for child in block.pointers {
        self.free_tree(child, depth - 1)?;
      }
    }
    self.free_block(pointer)
  }

  /// Release every data and pointer block of `inode` and reset its size.
  pub fn free_blocks(&mut self, inode: &mut Inode) -> Result<(), Errno> {
    for slot in 0..inode.block.len() {
      let depth = slot.saturating_sub(DIRECT_BLOCKS - 1);
      self.free_tree(inode.block[slot], depth)?;
      inode.block[slot] = NONE;
    }
    inode.size = 0;
    Ok(())
  }

  pub fn read_content(&mut self, inode: &Inode) -> Result<Vec<u8>, Errno> {
    let size = inode.size.max(0) as usize;
    let mut content = Vec::with_capacity(size);
    let mut logical = 0;
    while content.len() < size {
      let block = self
        .lookup_block(inode, logical)?
        .ok_or_else(|| Errno::EUCLEAN(format!("file of {size} bytes is missing block {logical}")))?;
      let block: FileBlock = self.read_block(block)?;
      let take = (size - content.len()).min(FILE_BLOCK_DATA);
      content.extend_from_slice(&block.content[..take]);
      logical += 1;
    }
    Ok(content)
  }

  /// Write `data` into an inode that holds no blocks. On failure every block
  /// allocated here is released again.
  pub fn write_content(&mut self, inode: &mut Inode, data: &[u8]) -> Result<(), Errno> {
    for (logical, chunk) in data.chunks(FILE_BLOCK_DATA).enumerate() {
      let written = self.ensure_block(inode, logical).and_then(|block| {
        let mut file_block = FileBlock::default();
        file_block.content[..chunk.len()].copy_from_slice(chunk);
        self.write_block(block, &file_block)
      });
      if let Err(errno) = written {
        self.free_blocks(inode)?;
        return Err(errno);
      }
    }
    inode.size = data.len() as i64;
    Ok(())
  }

  /// Physical blocks of a folder in logical order.
  pub fn folder_blocks(&mut self, inode: &Inode) -> Result<Vec<i64>, Errno> {
    let mut blocks = Vec::new();
    for logical in 0..MAX_BLOCKS {
      match self.lookup_block(inode, logical)? {
        Some(block) => blocks.push(block),
        None => break,
      }
    }
    Ok(blocks)
  }
}


// vim:ts=2 sw=2
