//! Read-only snapshots of on-disk structures, written out as YAML.

use std::path::Path;

use log::info;
use serde::Serialize;

use super::bitmap::Bitmap;
use super::device::BlockDevice;
use super::disk;
use super::fs::{ExtFilesystem, FileNode};
use super::kernel::Errno;
use super::mount::MountRegistry;
use super::partition::free_gaps;
use super::structs::{
  Ebr, FileBlock, FolderBlock, Inode, PointerBlock, DIRECT_BLOCKS, MBR_RESERVED, NONE, TYPE_EXTENDED, TYPE_LOGICAL,
};
use crate::util::{from_fixed, human_time};

/// Bitmap characters per row.
const BITMAP_ROW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
  Mbr,
  Disk,
  Superblock,
  InodeBitmap,
  BlockBitmap,
  Inodes,
  Blocks,
  Tree,
  File,
  Ls,
}

impl ReportKind {
  pub fn parse(name: &str) -> Result<Self, Errno> {
    match name.to_ascii_lowercase().as_str() {
      "mbr" => Ok(Self::Mbr),
      "disk" => Ok(Self::Disk),
      "sb" => Ok(Self::Superblock),
      "bm_inode" => Ok(Self::InodeBitmap),
      "bm_block" => Ok(Self::BlockBitmap),
      "inode" => Ok(Self::Inodes),
      "block" => Ok(Self::Blocks),
      "tree" => Ok(Self::Tree),
      "file" => Ok(Self::File),
      "ls" => Ok(Self::Ls),
      _ => Err(Errno::EINVAL(format!("unknown report '{name}'"))),
    }
  }

  /// Reports that only need the disk, not a formatted partition.
  pub fn is_disk_level(&self) -> bool {
    matches!(self, Self::Mbr | Self::Disk)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
  pub name: String,
  pub r#type: char,
  pub fit: char,
  pub start: i64,
  pub size: i64,
  pub status: char,
  pub id: String,
  pub mounted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
  pub path: String,
  pub size: i64,
  pub fit: char,
  pub signature: i64,
  pub created_at: String,
  pub partitions: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EbrInfo {
  pub offset: i64,
  pub name: String,
  pub part_mount: char,
  pub fit: char,
  pub start: i64,
  pub size: i64,
  pub next: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
  pub label: String,
  pub start: i64,
  pub size: i64,
  pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuperBlockInfo {
  pub fs_type: String,
  pub inodes_count: i64,
  pub blocks_count: i64,
  pub free_inodes_count: i64,
  pub free_blocks_count: i64,
  pub mtime: String,
  pub umtime: String,
  pub mnt_count: i64,
  pub magic: String,
  pub inode_size: i64,
  pub block_size: i64,
  pub first_free_inode: i64,
  pub first_free_block: i64,
  pub bm_inode_start: i64,
  pub bm_block_start: i64,
  pub inode_start: i64,
  pub block_start: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeInfo {
  pub index: i64,
  pub r#type: String,
  pub uid: i32,
  pub gid: i32,
  pub size: i64,
  pub perm: String,
  pub atime: String,
  pub ctime: String,
  pub mtime: String,
  pub block: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockContent {
  Folder { entries: Vec<(String, i64)> },
  File { content: String },
  Pointer { pointers: Vec<i64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
  pub index: i64,
  pub owner: i64,
  pub content: BlockContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
  Mbr { disk: DiskInfo, ebrs: Vec<EbrInfo> },
  Disk { path: String, size: i64, segments: Vec<Segment> },
  Superblock(SuperBlockInfo),
  Bitmap { bitmap: String, used: usize, total: usize, rows: Vec<String> },
  Inodes { inodes: Vec<InodeInfo> },
  Blocks { blocks: Vec<BlockInfo> },
  Tree { inodes: Vec<InodeInfo>, blocks: Vec<BlockInfo>, links: Vec<String> },
  File { path: String, size: usize, content: String },
  Ls { path: String, nodes: Vec<FileNode> },
}

impl Report {
  pub fn to_yaml(&self) -> Result<String, Errno> {
    serde_yaml::to_string(self).map_err(|error| Errno::EIO(format!("report: {error}")))
  }

  /// Write the report to `output` on the host, creating parent folders.
  pub fn write(&self, output: &Path) -> Result<(), Errno> {
    if let Some(parent) = output.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, self.to_yaml()?)?;
    info!("rep: wrote {}", output.display());
    Ok(())
  }
}

fn as_char(byte: u8) -> char {
  if byte == 0 { '-' } else { byte as char }
}

/// Partition table of a disk, logicals included.
pub fn disk_info(path: &Path, mounts: &MountRegistry) -> Result<DiskInfo, Errno> {
  let mut device = BlockDevice::open(path, false)?;
  let mbr = disk::read_mbr(&mut device)?;
  let partitions = disk::partitions(&mut device, &mbr)?
    .into_iter()
    .map(|located| {
      let mounted = mounts.find(path, &located.name);
      PartitionInfo {
        mounted: mounted.is_some(),
        id: mounted.map(|mounted| mounted.id.clone()).unwrap_or(located.id),
        name: located.name,
        r#type: as_char(located.r#type),
        fit: as_char(located.fit),
        start: located.start,
        size: located.size,
        status: as_char(located.status),
      }
    })
    .collect();

  Ok(DiskInfo {
    path: path.display().to_string(),
    size: mbr.size,
    fit: as_char(mbr.fit),
    signature: mbr.signature,
    created_at: human_time(mbr.created_at),
    partitions,
  })
}

pub fn mbr_report(path: &Path, mounts: &MountRegistry) -> Result<Report, Errno> {
  let disk_info = disk_info(path, mounts)?;
  let mut device = BlockDevice::open(path, false)?;
  let mbr = disk::read_mbr(&mut device)?;
  let ebrs = match disk::extended(&mbr) {
    Some((_, extended)) => {
      let extended = extended.clone();
      let mut ebrs = Vec::new();
      // the sentinel head sits at the start of the extended partition
      let head: Ebr = device.read_record(extended.start)?;
      ebrs.push(EbrInfo {
        offset: extended.start,
        name: head.name(),
        part_mount: as_char(head.part_mount),
        fit: as_char(head.fit),
        start: head.start,
        size: head.size,
        next: head.next,
      });
      for (offset, ebr) in disk::read_logicals(&mut device, &extended)? {
        ebrs.push(EbrInfo {
          offset,
          name: ebr.name(),
          part_mount: as_char(ebr.part_mount),
          fit: as_char(ebr.fit),
          start: ebr.start,
          size: ebr.size,
          next: ebr.next,
        });
      }
      ebrs
    }
    None => Vec::new(),
  };
  Ok(Report::Mbr { disk: disk_info, ebrs })
}

/// Share of the disk taken by each partition and each free gap.
pub fn disk_report(path: &Path) -> Result<Report, Errno> {
  let mut device = BlockDevice::open(path, false)?;
  let mbr = disk::read_mbr(&mut device)?;
  let total = mbr.size as f64;
  let percent = |size: i64| ((size as f64 / total) * 10000.0).round() / 100.0;

  let mut segments = vec![Segment {
    label: String::from("MBR"),
    start: 0,
    size: MBR_RESERVED,
    percent: percent(MBR_RESERVED),
  }];
  let located = disk::partitions(&mut device, &mbr)?;
  for partition in located.iter().filter(|partition| partition.r#type != TYPE_LOGICAL) {
    let kind = if partition.r#type == TYPE_EXTENDED { "extended" } else { "primary" };
    segments.push(Segment {
      label: format!("{kind} {}", partition.name),
      start: partition.start,
      size: partition.size,
      percent: percent(partition.size),
    });
    if partition.r#type == TYPE_EXTENDED {
      for logical in located.iter().filter(|logical| logical.r#type == TYPE_LOGICAL) {
        segments.push(Segment {
          label: format!("logical {}", logical.name),
          start: logical.start,
          size: logical.size,
          percent: percent(logical.size),
        });
      }
    }
  }

  let used = located
    .iter()
    .filter(|partition| partition.r#type != TYPE_LOGICAL)
    .map(|partition| (partition.start, partition.end()))
    .collect();
  for gap in free_gaps(used, MBR_RESERVED, mbr.size) {
    segments.push(Segment {
      label: String::from("free"),
      start: gap.start,
      size: gap.size,
      percent: percent(gap.size),
    });
  }
  segments.sort_by_key(|segment| (segment.start, segment.label.starts_with("logical")));

  Ok(Report::Disk { path: path.display().to_string(), size: mbr.size, segments })
}

fn inode_info(index: i64, inode: &Inode) -> InodeInfo {
  InodeInfo {
    index,
    r#type: String::from(if inode.is_folder() { "folder" } else { "file" }),
    uid: inode.uid,
    gid: inode.gid,
    size: inode.size,
    perm: String::from_utf8_lossy(&inode.perm).into_owned(),
    atime: human_time(inode.atime),
    ctime: human_time(inode.ctime),
    mtime: human_time(inode.mtime),
    block: inode.block.to_vec(),
  }
}

impl ExtFilesystem {
  fn collect_blocks(
    &mut self,
    owner: i64,
    folder: bool,
    pointer: i64,
    depth: usize,
    blocks: &mut Vec<BlockInfo>,
  ) -> Result<(), Errno> {
    if pointer == NONE {
      return Ok(());
    }
    let content = if depth > 0 {
      let block: PointerBlock = self.read_block(pointer)?;
      for child in block.pointers {
        self.collect_blocks(owner, folder, child, depth - 1, blocks)?;
      }
      BlockContent::Pointer { pointers: block.pointers.to_vec() }
    } else if folder {
      let block: FolderBlock = self.read_block(pointer)?;
      let entries = block
        .entries
        .iter()
        .map(|entry| (if entry.is_free() { String::new() } else { entry.name() }, entry.inode))
        .collect();
      BlockContent::Folder { entries }
    } else {
      let block: FileBlock = self.read_block(pointer)?;
      BlockContent::File { content: from_fixed(&block.content) }
    };
    blocks.push(BlockInfo { index: pointer, owner, content });
    Ok(())
  }

  /// Every used inode with the blocks it references.
  fn inventory(&mut self) -> Result<(Vec<InodeInfo>, Vec<BlockInfo>), Errno> {
    self.root()?;
    let mut inodes = Vec::new();
    let mut blocks = Vec::new();
    for (index, inode) in self.used_inodes()? {
      for (slot, &pointer) in inode.block.iter().enumerate() {
        let depth = slot.saturating_sub(DIRECT_BLOCKS - 1);
        self.collect_blocks(index, inode.is_folder(), pointer, depth, &mut blocks)?;
      }
      inodes.push(inode_info(index, &inode));
    }
    blocks.sort_by_key(|block| block.index);
    Ok((inodes, blocks))
  }

  pub fn report(&mut self, kind: ReportKind, path_file_ls: Option<&str>) -> Result<Report, Errno> {
    let report = match kind {
      ReportKind::Superblock => {
        let superblock = self.superblock.clone();
        Report::Superblock(SuperBlockInfo {
          fs_type: format!("ext{}", superblock.fs_type),
          inodes_count: superblock.inodes_count,
          blocks_count: superblock.blocks_count,
          free_inodes_count: superblock.free_inodes_count,
          free_blocks_count: superblock.free_blocks_count,
          mtime: human_time(superblock.mtime),
          umtime: if superblock.umtime == 0 { String::from("-") } else { human_time(superblock.umtime) },
          mnt_count: superblock.mnt_count,
          magic: format!("{:#X}", superblock.magic),
          inode_size: superblock.inode_size,
          block_size: superblock.block_size,
          first_free_inode: superblock.first_free_inode,
          first_free_block: superblock.first_free_block,
          bm_inode_start: superblock.bm_inode_start,
          bm_block_start: superblock.bm_block_start,
          inode_start: superblock.inode_start,
          block_start: superblock.block_start,
        })
      }
      ReportKind::InodeBitmap | ReportKind::BlockBitmap => {
        let (name, bitmap) = match kind {
          ReportKind::InodeBitmap => ("inodes", Bitmap::Inodes),
          _ => ("blocks", Bitmap::Blocks),
        };
        let bytes = self.read_bitmap(bitmap)?;
        Report::Bitmap {
          bitmap: String::from(name),
          used: bytes.iter().filter(|&&byte| byte == b'1').count(),
          total: bytes.len(),
          rows: bytes
            .chunks(BITMAP_ROW)
            .map(|row| row.iter().map(|&byte| as_char(byte)).collect())
            .collect(),
        }
      }
      ReportKind::Inodes => Report::Inodes { inodes: self.inventory()?.0 },
      ReportKind::Blocks => Report::Blocks { blocks: self.inventory()?.1 },
      ReportKind::Tree => {
        let (inodes, blocks) = self.inventory()?;
        let mut links = Vec::new();
        for block in &blocks {
          links.push(format!("inode{} -> block{}", block.owner, block.index));
          if let BlockContent::Folder { entries } = &block.content {
            for (name, child) in entries {
              if !name.is_empty() && name != "." && name != ".." {
                links.push(format!("block{} -> inode{child} ({name})", block.index));
              }
            }
          }
        }
        Report::Tree { inodes, blocks, links }
      }
      ReportKind::File => {
        let path = path_file_ls.ok_or_else(|| Errno::EINVAL(String::from("rep file needs -path_file_ls")))?;
        let (_, inode) = self.resolve(path)?;
        if inode.is_folder() {
          return Err(Errno::EISDIR(format!("{path}: is a folder")));
        }
        let content = self.read_content(&inode)?;
        Report::File {
          path: path.to_owned(),
          size: content.len(),
          content: String::from_utf8_lossy(&content).into_owned(),
        }
      }
      ReportKind::Ls => {
        let path = path_file_ls.unwrap_or("/");
        Report::Ls { path: path.to_owned(), nodes: self.list(path)? }
      }
      ReportKind::Mbr | ReportKind::Disk => {
        return Err(Errno::EINVAL(String::from("disk reports are built from the disk, not the partition")))
      }
    };
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extfs::disk::mkdisk;
  use crate::extfs::fs::tests::formatted;
  use crate::extfs::partition::create;
  use crate::extfs::perms::Credentials;
  use crate::extfs::structs::{Fit, TYPE_PRIMARY};
  use crate::util::mktemp;

  #[test]
  fn report_names() {
    assert_eq!(ReportKind::parse("BM_INODE").unwrap(), ReportKind::InodeBitmap);
    assert_eq!(ReportKind::parse("sb").unwrap(), ReportKind::Superblock);
    assert!(ReportKind::parse("graph").is_err());
    assert!(ReportKind::Disk.is_disk_level());
  }

  #[test]
  fn disk_reports_cover_the_disk() {
    let path = mktemp();
    mkdisk(&path, 64 * 1024, Fit::First).unwrap();
    create(&path, "p1", 8 * 1024, TYPE_PRIMARY, Fit::First).unwrap();
    create(&path, "ext", 16 * 1024, TYPE_EXTENDED, Fit::First).unwrap();
    create(&path, "l1", 4096, TYPE_LOGICAL, Fit::First).unwrap();
    let mounts = MountRegistry::new("53");

    let info = disk_info(&path, &mounts).unwrap();
    assert_eq!(info.size, 64 * 1024);
    let names: Vec<&str> = info.partitions.iter().map(|partition| partition.name.as_str()).collect();
    assert_eq!(names, vec!["p1", "ext", "l1"]);
    assert_eq!(info.partitions[2].r#type, 'L');

    match disk_report(&path).unwrap() {
      Report::Disk { segments, .. } => {
        let covered: i64 = segments
          .iter()
          .filter(|segment| !segment.label.starts_with("logical"))
          .map(|segment| segment.size)
          .sum();
        assert_eq!(covered, 64 * 1024);
        assert!(segments.iter().any(|segment| segment.label == "logical l1"));
      }
      other => panic!("unexpected report {other:?}"),
    }

    match mbr_report(&path, &mounts).unwrap() {
      Report::Mbr { ebrs, .. } => {
        assert_eq!(ebrs.len(), 2);
        assert_eq!(ebrs[0].size, 0);
        assert_eq!(ebrs[1].name, "l1");
      }
      other => panic!("unexpected report {other:?}"),
    }
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn filesystem_reports() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();
    fs.mkdir(&root, "/docs", false).unwrap();
    fs.mkfile(&root, "/docs/a", false, b"alpha").unwrap();

    match fs.report(ReportKind::InodeBitmap, None).unwrap() {
      Report::Bitmap { used, rows, .. } => {
        assert_eq!(used, 4);
        assert!(rows[0].starts_with("1111"));
        assert_eq!(rows[0].len(), 20);
      }
      other => panic!("unexpected report {other:?}"),
    }

    match fs.report(ReportKind::Tree, None).unwrap() {
      Report::Tree { inodes, blocks, links } => {
        assert_eq!(inodes.len(), 4);
        assert_eq!(blocks.len(), 4);
        assert!(links.contains(&String::from("block0 -> inode1 (users.txt)")));
        assert!(links.iter().any(|link| link.ends_with("(docs)")));
      }
      other => panic!("unexpected report {other:?}"),
    }

    match fs.report(ReportKind::File, Some("/docs/a")).unwrap() {
      Report::File { content, .. } => assert_eq!(content, "alpha"),
      other => panic!("unexpected report {other:?}"),
    }
    assert!(fs.report(ReportKind::File, None).is_err());

    let yaml = fs.report(ReportKind::Superblock, None).unwrap().to_yaml().unwrap();
    assert!(yaml.contains("report: superblock"));
    assert!(yaml.contains("0xEF53"));

    let output = mktemp().join("ls.yaml");
    fs.report(ReportKind::Ls, Some("/docs")).unwrap().write(&output).unwrap();
    assert!(std::fs::read_to_string(&output).unwrap().contains("name: a"));

    drop(fs);
    std::fs::remove_file(path).unwrap();
    std::fs::remove_dir_all(output.parent().unwrap()).unwrap();
  }
}

// vim:ts=2 sw=2
