use std::path::Path;

use log::{debug, info};

use super::codec::Record;
use super::device::BlockDevice;
use super::kernel::Errno;
use super::structs::{Ebr, Fit, Mbr, Partition, NONE, TYPE_EXTENDED, TYPE_LOGICAL};
use crate::util::unixtime;

/// Size in bytes of `size` `unit`s. `B` is only accepted when `allow_bytes` is set.
pub fn unit_bytes(size: i64, unit: &str, allow_bytes: bool) -> Result<i64, Errno> {
  let multiplier = match unit.to_ascii_uppercase().as_str() {
    "B" if allow_bytes => 1,
    "K" => 1024,
    "M" => 1024 * 1024,
    _ => return Err(Errno::EINVAL(format!("invalid unit '{unit}'"))),
  };
  size
    .checked_mul(multiplier)
    .ok_or_else(|| Errno::EINVAL(format!("size {size}{unit} overflows")))
}

/// Random positive 32-bit disk signature.
fn signature() -> i64 {
  (uuid::Uuid::new_v4().as_u128() as u32 & 0x7fff_ffff) as i64
}

pub fn mkdisk(path: &Path, size: i64, fit: Fit) -> Result<Mbr, Errno> {
  if size <= 0 {
    return Err(Errno::EINVAL(format!("disk size must be positive, got {size}")));
  }
  if size < Mbr::SIZE as i64 {
    return Err(Errno::EINVAL(format!("disk of {size} bytes cannot hold an MBR")));
  }

  let mut device = BlockDevice::create(path, size)?;
  let mbr = Mbr {
    size,
    created_at: unixtime(),
    signature: signature(),
    fit: fit.as_byte(),
    partitions: Default::default(),
  };
  write_mbr(&mut device, &mbr)?;
  device.flush()?;
  info!("mkdisk: {} ({size} bytes, signature {})", path.display(), mbr.signature);

  Ok(mbr)
}

pub fn rmdisk(path: &Path) -> Result<(), Errno> {
  if !path.is_file() {
    return Err(Errno::ENOENT(format!("{}: no such disk", path.display())));
  }
  std::fs::remove_file(path)?;
  info!("rmdisk: {}", path.display());
  Ok(())
}

pub fn read_mbr(device: &mut BlockDevice) -> Result<Mbr, Errno> {
  let mbr: Mbr = device.read_record(0)?;
  if mbr.size != device.size() {
    return Err(Errno::EUCLEAN(format!(
      "{}: MBR records {} bytes but disk holds {}",
      device.path().display(),
      mbr.size,
      device.size()
    )));
  }
  Ok(mbr)
}

pub fn write_mbr(device: &mut BlockDevice, mbr: &Mbr) -> Result<(), Errno> {
  device.write_record(0, mbr)
}

pub fn extended(mbr: &Mbr) -> Option<(usize, &Partition)> {
  mbr
    .partitions
    .iter()
    .enumerate()
    .find(|(_, partition)| partition.is_used() && partition.r#type == TYPE_EXTENDED)
}

/// Logical partitions of `extended` as `(ebr_offset, ebr)`, in chain order.
/// The sentinel EBR at the extended start is skipped.
pub fn read_logicals(device: &mut BlockDevice, extended: &Partition) -> Result<Vec<(i64, Ebr)>, Errno> {
  let head: Ebr = device.read_record(extended.start)?;
  let mut logicals = Vec::new();
  let mut next = head.next;

  while next != NONE {
    if next < extended.start || next + Ebr::SIZE as i64 > extended.end() {
      return Err(Errno::EUCLEAN(format!("EBR link {next} outside extended partition")));
    }
    if logicals.len() > (extended.size / Ebr::SIZE as i64) as usize {
      return Err(Errno::EUCLEAN(String::from("EBR chain loops")));
    }
    let ebr: Ebr = device.read_record(next)?;
    let following = ebr.next;
    logicals.push((next, ebr));
    next = following;
  }

  Ok(logicals)
}

/// Rewrite the EBR chain of `extended` from `logicals`, sorted by offset.
pub fn write_logicals(
  device: &mut BlockDevice,
  extended: &Partition,
  mut logicals: Vec<(i64, Ebr)>,
) -> Result<(), Errno> {
  logicals.sort_by_key(|(offset, _)| *offset);

  let mut head = Ebr { fit: extended.fit, start: extended.start, ..Default::default() };
  head.next = logicals.first().map(|(offset, _)| *offset).unwrap_or(NONE);
  device.write_record(extended.start, &head)?;

  for index in 0..logicals.len() {
    let next = logicals.get(index + 1).map(|(offset, _)| *offset).unwrap_or(NONE);
    let (offset, ebr) = &mut logicals[index];
    ebr.next = next;
    device.write_record(*offset, ebr)?;
  }
  debug!("ebr chain rewritten: {} logical partition(s)", logicals.len());
  Ok(())
}

/// Where a partition's metadata lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
  Primary(usize),
  Logical(i64),
}

/// A named partition resolved on a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
  pub slot: Slot,
  pub name: String,
  pub r#type: u8,
  pub fit: u8,
  pub start: i64,
  pub size: i64,
  pub status: u8,
  pub correlative: i64,
  pub id: String,
}

impl Located {
  fn primary(index: usize, partition: &Partition) -> Self {
    Self {
      slot: Slot::Primary(index),
      name: partition.name(),
      r#type: partition.r#type,
      fit: partition.fit,
      start: partition.start,
      size: partition.size,
      status: partition.status,
      correlative: partition.correlative,
      id: partition.id(),
    }
  }

  fn logical(offset: i64, ebr: &Ebr) -> Self {
    Self {
      slot: Slot::Logical(offset),
      name: ebr.name(),
      r#type: TYPE_LOGICAL,
      fit: ebr.fit,
      start: ebr.start,
      size: ebr.size,
      status: ebr.part_mount,
      correlative: NONE,
      id: String::new(),
    }
  }

  pub fn end(&self) -> i64 {
    self.start + self.size
  }
}

/// Every partition on the disk, primaries in slot order then logicals.
pub fn partitions(device: &mut BlockDevice, mbr: &Mbr) -> Result<Vec<Located>, Errno> {
  let mut located: Vec<Located> = mbr
    .partitions
    .iter()
    .enumerate()
    .filter(|(_, partition)| partition.is_used())
    .map(|(index, partition)| Located::primary(index, partition))
    .collect();

  if let Some((_, extended)) = extended(mbr) {
    for (offset, ebr) in read_logicals(device, extended)? {
      located.push(Located::logical(offset, &ebr));
    }
  }
  Ok(located)
}

pub fn find_partition(device: &mut BlockDevice, mbr: &Mbr, name: &str) -> Result<Located, Errno> {
  partitions(device, mbr)?
    .into_iter()
    .find(|partition| partition.name == name)
    .ok_or_else(|| Errno::ENOENT(format!("{}: no partition named '{name}'", device.path().display())))
}


// vim:ts=2 sw=2
