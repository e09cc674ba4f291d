//! On-disk records. Everything is packed and little-endian; see `Record`.

use super::codec::{Reader, Record};
use super::kernel::Errno;
use crate::util::{from_fixed, to_fixed};

pub const MAGIC: i64 = 0xEF53;
/// Sentinel for unused block slots, EBR links and free folder entries.
pub const NONE: i64 = -1;
/// Bytes at the start of a disk reserved for the MBR.
pub const MBR_RESERVED: i64 = 512;
/// Stride of one block slot. A folder block is the largest variant.
pub const BLOCK_SIZE: i64 = FolderBlock::SIZE as i64;
pub const FILE_BLOCK_DATA: usize = 64;
pub const POINTERS_PER_BLOCK: usize = 8;
pub const DIRECT_BLOCKS: usize = 12;
pub const ENTRIES_PER_FOLDER: usize = 4;
pub const NAME_MAX: usize = 12;
pub const JOURNAL_CAPACITY: i64 = 50;

pub const INODE_FILE: u8 = b'0';
pub const INODE_FOLDER: u8 = b'1';

pub const STATUS_EMPTY: u8 = b'0';
pub const STATUS_ACTIVE: u8 = b'1';
pub const STATUS_MOUNTED: u8 = b'N';

pub const TYPE_PRIMARY: u8 = b'P';
pub const TYPE_EXTENDED: u8 = b'E';
pub const TYPE_LOGICAL: u8 = b'L';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
  Best,
  First,
  Worst,
}

impl Fit {
  /// Parse `BF`, `FF` or `WF` (any case).
  pub fn parse(fit: &str) -> Result<Self, Errno> {
    match fit.to_ascii_uppercase().as_str() {
      "BF" => Ok(Fit::Best),
      "FF" => Ok(Fit::First),
      "WF" => Ok(Fit::Worst),
      _ => Err(Errno::EINVAL(format!("invalid fit '{fit}': expected BF, FF or WF"))),
    }
  }

  pub fn from_byte(byte: u8) -> Result<Self, Errno> {
    match byte {
      b'B' => Ok(Fit::Best),
      b'F' => Ok(Fit::First),
      b'W' => Ok(Fit::Worst),
      _ => Err(Errno::EUCLEAN(format!("invalid fit byte {byte:#04x}"))),
    }
  }

  pub fn as_byte(&self) -> u8 {
    match self {
      Fit::Best => b'B',
      Fit::First => b'F',
      Fit::Worst => b'W',
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
  pub status: u8,
  pub r#type: u8,
  pub fit: u8,
  pub start: i64,
  pub size: i64,
  pub name: [u8; 16],
  pub correlative: i64,
  pub id: [u8; 4],
}

impl Default for Partition {
  fn default() -> Self {
    Self {
      status: STATUS_EMPTY,
      r#type: 0,
      fit: 0,
      start: NONE,
      size: 0,
      name: [0; 16],
      correlative: NONE,
      id: [0; 4],
    }
  }
}

impl Partition {
  pub fn is_used(&self) -> bool {
    self.status != STATUS_EMPTY && self.start >= 0 && self.size > 0
  }

  pub fn name(&self) -> String {
    from_fixed(&self.name)
  }

  pub fn id(&self) -> String {
    from_fixed(&self.id)
  }

  pub fn end(&self) -> i64 {
    self.start + self.size
  }
}

impl Record for Partition {
  const SIZE: usize = 3 + 8 + 8 + 16 + 8 + 4;

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    bytes.push(self.status);
    bytes.push(self.r#type);
    bytes.push(self.fit);
    bytes.extend_from_slice(&self.start.to_le_bytes());
    bytes.extend_from_slice(&self.size.to_le_bytes());
    bytes.extend_from_slice(&self.name);
    bytes.extend_from_slice(&self.correlative.to_le_bytes());
    bytes.extend_from_slice(&self.id);
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    Ok(Self {
      status: reader.u8()?,
      r#type: reader.u8()?,
      fit: reader.u8()?,
      start: reader.i64()?,
      size: reader.i64()?,
      name: reader.array()?,
      correlative: reader.i64()?,
      id: reader.array()?,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
  pub size: i64,
  pub created_at: i64,
  pub signature: i64,
  pub fit: u8,
  pub partitions: [Partition; 4],
}

impl Default for Mbr {
  fn default() -> Self {
    Self {
      size: 0,
      created_at: 0,
      signature: 0,
      fit: b'F',
      partitions: Default::default(),
    }
  }
}

impl Record for Mbr {
  const SIZE: usize = 8 + 8 + 8 + 1 + 4 * Partition::SIZE;

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    bytes.extend_from_slice(&self.size.to_le_bytes());
    bytes.extend_from_slice(&self.created_at.to_le_bytes());
    bytes.extend_from_slice(&self.signature.to_le_bytes());
    bytes.push(self.fit);
    for partition in &self.partitions {
      bytes.extend_from_slice(&partition.encode());
    }
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    let size = reader.i64()?;
    let created_at = reader.i64()?;
    let signature = reader.i64()?;
    let fit = reader.u8()?;
    let mut partitions: [Partition; 4] = Default::default();
    for partition in partitions.iter_mut() {
      *partition = Partition::decode(reader.take(Partition::SIZE)?)?;
    }
    Ok(Self { size, created_at, signature, fit, partitions })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ebr {
  pub part_mount: u8,
  pub fit: u8,
  pub start: i64,
  pub size: i64,
  pub next: i64,
  pub name: [u8; 16],
}

impl Default for Ebr {
  fn default() -> Self {
    Self {
      part_mount: STATUS_EMPTY,
      fit: 0,
      start: NONE,
      size: 0,
      next: NONE,
      name: [0; 16],
    }
  }
}

impl Ebr {
  pub fn name(&self) -> String {
    from_fixed(&self.name)
  }

  pub fn end(&self) -> i64 {
    self.start + self.size
  }
}

impl Record for Ebr {
  const SIZE: usize = 2 + 8 + 8 + 8 + 16;

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    bytes.push(self.part_mount);
    bytes.push(self.fit);
    bytes.extend_from_slice(&self.start.to_le_bytes());
    bytes.extend_from_slice(&self.size.to_le_bytes());
    bytes.extend_from_slice(&self.next.to_le_bytes());
    bytes.extend_from_slice(&self.name);
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    Ok(Self {
      part_mount: reader.u8()?,
      fit: reader.u8()?,
      start: reader.i64()?,
      size: reader.i64()?,
      next: reader.i64()?,
      name: reader.array()?,
    })
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuperBlock {
  pub fs_type: i64,
  pub inodes_count: i64,
  pub blocks_count: i64,
  pub free_blocks_count: i64,
  pub free_inodes_count: i64,
  pub mtime: i64,
  pub umtime: i64,
  pub mnt_count: i64,
  pub magic: i64,
  pub inode_size: i64,
  pub block_size: i64,
  pub first_free_inode: i64,
  pub first_free_block: i64,
  pub bm_inode_start: i64,
  pub bm_block_start: i64,
  pub inode_start: i64,
  pub block_start: i64,
}

impl SuperBlock {
  fn fields(&self) -> [i64; 17] {
    [
      self.fs_type,
      self.inodes_count,
      self.blocks_count,
      self.free_blocks_count,
      self.free_inodes_count,
      self.mtime,
      self.umtime,
      self.mnt_count,
      self.magic,
      self.inode_size,
      self.block_size,
      self.first_free_inode,
      self.first_free_block,
      self.bm_inode_start,
      self.bm_block_start,
      self.inode_start,
      self.block_start,
    ]
  }

  pub fn inode_offset(&self, index: i64) -> i64 {
    self.inode_start + index * self.inode_size
  }

  pub fn block_offset(&self, index: i64) -> i64 {
    self.block_start + index * self.block_size
  }

  /// One past the last byte the filesystem occupies.
  pub fn end(&self) -> i64 {
    self.block_start + self.blocks_count * self.block_size
  }
}

impl Record for SuperBlock {
  const SIZE: usize = 17 * 8;

  fn encode(&self) -> Vec<u8> {
    self.fields().iter().flat_map(|field| field.to_le_bytes()).collect()
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    Ok(Self {
      fs_type: reader.i64()?,
      inodes_count: reader.i64()?,
      blocks_count: reader.i64()?,
      free_blocks_count: reader.i64()?,
      free_inodes_count: reader.i64()?,
      mtime: reader.i64()?,
      umtime: reader.i64()?,
      mnt_count: reader.i64()?,
      magic: reader.i64()?,
      inode_size: reader.i64()?,
      block_size: reader.i64()?,
      first_free_inode: reader.i64()?,
      first_free_block: reader.i64()?,
      bm_inode_start: reader.i64()?,
      bm_block_start: reader.i64()?,
      inode_start: reader.i64()?,
      block_start: reader.i64()?,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
  pub uid: i32,
  pub gid: i32,
  pub size: i64,
  pub atime: i64,
  pub ctime: i64,
  pub mtime: i64,
  pub block: [i64; 15],
  pub r#type: u8,
  pub perm: [u8; 3],
}

impl Default for Inode {
  fn default() -> Self {
    Self {
      uid: 0,
      gid: 0,
      size: 0,
      atime: 0,
      ctime: 0,
      mtime: 0,
      block: [NONE; 15],
      r#type: INODE_FILE,
      perm: *b"664",
    }
  }
}

impl Inode {
  pub fn new(r#type: u8, uid: i32, gid: i32, perm: [u8; 3], now: i64) -> Self {
    Self {
      uid,
      gid,
      size: 0,
      atime: now,
      ctime: now,
      mtime: now,
      block: [NONE; 15],
      r#type,
      perm,
    }
  }

  pub fn is_folder(&self) -> bool {
    self.r#type == INODE_FOLDER
  }

  pub fn is_file(&self) -> bool {
    self.r#type == INODE_FILE
  }

  pub fn touch(&mut self, now: i64) {
    self.mtime = now;
    self.ctime = now;
  }
}

impl Record for Inode {
  const SIZE: usize = 4 + 4 + 8 * 4 + 15 * 8 + 1 + 3;

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    bytes.extend_from_slice(&self.uid.to_le_bytes());
    bytes.extend_from_slice(&self.gid.to_le_bytes());
    bytes.extend_from_slice(&self.size.to_le_bytes());
    bytes.extend_from_slice(&self.atime.to_le_bytes());
    bytes.extend_from_slice(&self.ctime.to_le_bytes());
    bytes.extend_from_slice(&self.mtime.to_le_bytes());
    for pointer in &self.block {
      bytes.extend_from_slice(&pointer.to_le_bytes());
    }
    bytes.push(self.r#type);
    bytes.extend_from_slice(&self.perm);
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    let uid = reader.i32()?;
    let gid = reader.i32()?;
    let size = reader.i64()?;
    let atime = reader.i64()?;
    let ctime = reader.i64()?;
    let mtime = reader.i64()?;
    let mut block = [NONE; 15];
    for pointer in block.iter_mut() {
      *pointer = reader.i64()?;
    }
    Ok(Self {
      uid,
      gid,
      size,
      atime,
      ctime,
      mtime,
      block,
      r#type: reader.u8()?,
      perm: reader.array()?,
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
  pub name: [u8; NAME_MAX],
  pub inode: i64,
}

impl Default for FolderEntry {
  fn default() -> Self {
    Self { name: [0; NAME_MAX], inode: NONE }
  }
}

impl FolderEntry {
  pub fn new(name: &str, inode: i64) -> Self {
    Self { name: to_fixed(name), inode }
  }

  pub fn is_free(&self) -> bool {
    self.inode < 0
  }

  pub fn name(&self) -> String {
    from_fixed(&self.name)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderBlock {
  pub entries: [FolderEntry; ENTRIES_PER_FOLDER],
}

impl FolderBlock {
  /// First block of a folder: `.` and `..` in the first two slots.
  pub fn with_links(this: i64, parent: i64) -> Self {
    let mut block = Self::default();
    block.entries[0] = FolderEntry::new(".", this);
    block.entries[1] = FolderEntry::new("..", parent);
    block
  }
}

impl Record for FolderBlock {
  const SIZE: usize = ENTRIES_PER_FOLDER * (NAME_MAX + 4 + 8);

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    for entry in &self.entries {
      bytes.extend_from_slice(&entry.name);
      bytes.extend_from_slice(&[0u8; 4]);
      bytes.extend_from_slice(&entry.inode.to_le_bytes());
    }
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    let mut block = Self::default();
    for entry in block.entries.iter_mut() {
      entry.name = reader.array()?;
      reader.take(4)?;
      entry.inode = reader.i64()?;
    }
    Ok(block)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
  pub content: [u8; FILE_BLOCK_DATA],
}

impl Default for FileBlock {
  fn default() -> Self {
    Self { content: [0; FILE_BLOCK_DATA] }
  }
}

impl Record for FileBlock {
  const SIZE: usize = FILE_BLOCK_DATA;

  fn encode(&self) -> Vec<u8> {
    self.content.to_vec()
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    Ok(Self { content: Reader::new(bytes).array()? })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerBlock {
  pub pointers: [i64; POINTERS_PER_BLOCK],
}

impl Default for PointerBlock {
  fn default() -> Self {
    Self { pointers: [NONE; POINTERS_PER_BLOCK] }
  }
}

impl PointerBlock {
  pub fn is_empty(&self) -> bool {
    self.pointers.iter().all(|&pointer| pointer == NONE)
  }
}

impl Record for PointerBlock {
  const SIZE: usize = POINTERS_PER_BLOCK * 8;

  fn encode(&self) -> Vec<u8> {
    self.pointers.iter().flat_map(|pointer| pointer.to_le_bytes()).collect()
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    let mut block = Self::default();
    for pointer in block.pointers.iter_mut() {
      *pointer = reader.i64()?;
    }
    Ok(block)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
  pub count: i32,
  pub operation: [u8; 10],
  pub path: [u8; 32],
  pub content: [u8; 64],
  pub date: f32,
}

impl Default for JournalEntry {
  fn default() -> Self {
    Self {
      count: 0,
      operation: [0; 10],
      path: [0; 32],
      content: [0; 64],
      date: 0.0,
    }
  }
}

impl JournalEntry {
  pub fn operation(&self) -> String {
    from_fixed(&self.operation)
  }

  pub fn path(&self) -> String {
    from_fixed(&self.path)
  }

  pub fn content(&self) -> String {
    from_fixed(&self.content)
  }
}

impl Record for JournalEntry {
  const SIZE: usize = 4 + 10 + 32 + 64 + 4;

  fn encode(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::SIZE);
    bytes.extend_from_slice(&self.count.to_le_bytes());
    bytes.extend_from_slice(&self.operation);
    bytes.extend_from_slice(&self.path);
    bytes.extend_from_slice(&self.content);
    bytes.extend_from_slice(&self.date.to_le_bytes());
    bytes
  }

  fn decode(bytes: &[u8]) -> Result<Self, Errno> {
    let mut reader = Reader::new(bytes);
    Ok(Self {
      count: reader.i32()?,
      operation: reader.array()?,
      path: reader.array()?,
      content: reader.array()?,
      date: reader.f32()?,
    })
  }
}

/// Verify every record encodes to its declared size.
pub fn verify_layout() -> Result<(), Errno> {
  use super::codec::verify;

  verify::<Partition>("partition")?;
  verify::<Mbr>("mbr")?;
  verify::<Ebr>("ebr")?;
  verify::<SuperBlock>("superblock")?;
  verify::<Inode>("inode")?;
  verify::<FolderBlock>("folder block")?;
  verify::<FileBlock>("file block")?;
  verify::<PointerBlock>("pointer block")?;
  verify::<JournalEntry>("journal entry")?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layout_sizes() {
    assert_eq!(Partition::SIZE, 47);
    assert_eq!(Mbr::SIZE, 213);
    assert_eq!(Ebr::SIZE, 42);
    assert_eq!(SuperBlock::SIZE, 136);
    assert_eq!(Inode::SIZE, 164);
    assert_eq!(FolderBlock::SIZE, 96);
    assert_eq!(FileBlock::SIZE, 64);
    assert_eq!(PointerBlock::SIZE, 64);
    assert_eq!(JournalEntry::SIZE, 114);
    assert!(Mbr::SIZE as i64 <= MBR_RESERVED);
    verify_layout().unwrap();
  }

  #[test]
  fn inode_round_trip_keeps_pointers() {
    let mut inode = Inode::new(INODE_FOLDER, 1, 1, *b"777", 1_700_000_000);
    inode.block[0] = 0;
    inode.block[14] = 99;
    inode.size = 12345;

    assert_eq!(Inode::decode(&inode.encode()).unwrap(), inode);
  }

  #[test]
  fn mbr_round_trip_keeps_partitions() {
    let mut mbr = Mbr { size: 10 * 1024 * 1024, created_at: 1, signature: 42, ..Default::default() };
    mbr.partitions[2] = Partition {
      status: STATUS_MOUNTED,
      r#type: TYPE_EXTENDED,
      fit: b'W',
      start: 512,
      size: 4096,
      name: to_fixed("ext"),
      correlative: 3,
      id: *b"533A",
    };

    let decoded = Mbr::decode(&mbr.encode()).unwrap();
    assert_eq!(decoded, mbr);
    assert_eq!(decoded.partitions[2].name(), "ext");
    assert_eq!(decoded.partitions[2].id(), "533A");
  }

  #[test]
  fn ebr_round_trip_keeps_the_chain() {
    let ebr = Ebr {
      part_mount: STATUS_MOUNTED,
      fit: b'B',
      start: 4096,
      size: 8192,
      next: 12_330,
      name: to_fixed("logic1"),
    };
    let decoded = Ebr::decode(&ebr.encode()).unwrap();
    assert_eq!(decoded, ebr);
    assert_eq!(decoded.name(), "logic1");
    assert_eq!(Ebr::decode(&Ebr::default().encode()).unwrap().next, NONE);
  }

  #[test]
  fn superblock_round_trip_keeps_every_field() {
    let superblock = SuperBlock {
      fs_type: 3,
      inodes_count: 11_467,
      blocks_count: 34_401,
      free_blocks_count: 34_399,
      free_inodes_count: 11_465,
      mtime: 1_700_000_000,
      umtime: 1_700_000_500,
      mnt_count: 4,
      magic: MAGIC,
      inode_size: Inode::SIZE as i64,
      block_size: 64,
      first_free_inode: 2,
      first_free_block: 2,
      bm_inode_start: 5_836,
      bm_block_start: 17_303,
      inode_start: 51_704,
      block_start: 1_932_292,
    };
    assert_eq!(SuperBlock::decode(&superblock.encode()).unwrap(), superblock);
  }

  #[test]
  fn data_blocks_round_trip() {
    let mut file = FileBlock::default();
    file.content[..5].copy_from_slice(b"hello");
    file.content[63] = b'!';
    assert_eq!(FileBlock::decode(&file.encode()).unwrap(), file);

    let mut pointers = PointerBlock::default();
    pointers.pointers[0] = 7;
    pointers.pointers[7] = 1_234_567;
    let decoded = PointerBlock::decode(&pointers.encode()).unwrap();
    assert_eq!(decoded, pointers);
    assert!(!decoded.is_empty());
    assert!(PointerBlock::decode(&PointerBlock::default().encode()).unwrap().is_empty());
  }

  #[test]
  fn folder_block_links_and_padding() {
    let block = FolderBlock::with_links(5, 2);
    let bytes = block.encode();

    assert_eq!(&bytes[0..1], b".");
    assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    assert_eq!(i64::from_le_bytes(bytes[16..24].try_into().unwrap()), 5);
    assert_eq!(FolderBlock::decode(&bytes).unwrap().entries[1].name(), "..");
    assert!(block.entries[2].is_free());
  }

  #[test]
  fn twelve_byte_names_fill_the_field() {
    let entry = FolderEntry::new("abcdefghijkl", 3);
    assert_eq!(entry.name(), "abcdefghijkl");
  }

  #[test]
  fn journal_entry_strings() {
    let entry = JournalEntry {
      count: 1,
      operation: to_fixed("mkdir"),
      path: to_fixed("/a/b"),
      ..Default::default()
    };
    let decoded = JournalEntry::decode(&entry.encode()).unwrap();
    assert_eq!(decoded.operation(), "mkdir");
    assert_eq!(decoded.path(), "/a/b");
    assert_eq!(decoded.content(), "");
  }

  #[test]
  fn fit_parsing() {
    assert_eq!(Fit::parse("bf").unwrap(), Fit::Best);
    assert_eq!(Fit::parse("FF").unwrap().as_byte(), b'F');
    assert!(Fit::parse("XF").is_err());
  }
}

// vim:ts=2 sw=2
