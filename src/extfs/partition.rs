use std::path::Path;

use log::info;

use super::codec::Record;
use super::device::BlockDevice;
use super::disk::{self, Located, Slot};
use super::kernel::Errno;
use super::structs::{
  Ebr, Fit, Partition, MBR_RESERVED, NONE, STATUS_ACTIVE, TYPE_EXTENDED, TYPE_LOGICAL, TYPE_PRIMARY,
};
use crate::util::to_fixed;

/// Longest partition name; the on-disk field keeps a trailing NUL.
pub const PARTITION_NAME_MAX: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
  pub start: i64,
  pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
  Fast,
  Full,
}

impl DeleteMode {
  pub fn parse(mode: &str) -> Result<Self, Errno> {
    match mode.to_ascii_lowercase().as_str() {
      "fast" => Ok(DeleteMode::Fast),
      "full" => Ok(DeleteMode::Full),
      _ => Err(Errno::EINVAL(format!("invalid delete mode '{mode}': expected fast or full"))),
    }
  }
}

/// Free gaps in `[low, high)` around the `used` ranges.
pub fn free_gaps(mut used: Vec<(i64, i64)>, low: i64, high: i64) -> Vec<Gap> {
  used.sort();
  let mut gaps = Vec::new();
  let mut cursor = low;
  for (start, end) in used {
    if start > cursor {
      gaps.push(Gap { start: cursor, size: start - cursor });
    }
    cursor = cursor.max(end);
  }
  if high > cursor {
    gaps.push(Gap { start: cursor, size: high - cursor });
  }
  gaps
}

/// Pick a gap for `size` bytes. Ties go to the lowest offset.
pub fn choose_gap(gaps: &[Gap], size: i64, fit: Fit) -> Result<Gap, Errno> {
  let chosen = match fit {
    Fit::First => gaps.iter().find(|gap| gap.size >= size).copied(),
    Fit::Best => gaps
      .iter()
      .filter(|gap| gap.size >= size)
      .min_by_key(|gap| (gap.size, gap.start))
      .copied(),
    Fit::Worst => gaps
      .iter()
      .max_by_key(|gap| (gap.size, -gap.start))
      .filter(|gap| gap.size >= size)
      .copied(),
  };
  chosen.ok_or_else(|| Errno::ENOSPC(format!("no free gap of {size} bytes ({fit:?} fit)")))
}

fn validate_name(name: &str) -> Result<(), Errno> {
  if name.is_empty() {
    return Err(Errno::EINVAL(String::from("partition name is empty")));
  }
  if name.len() > PARTITION_NAME_MAX {
    return Err(Errno::ENAMETOOLONG(format!("partition name '{name}' exceeds {PARTITION_NAME_MAX} bytes")));
  }
  Ok(())
}

pub fn create(path: &Path, name: &str, size: i64, r#type: u8, fit: Fit) -> Result<Located, Errno> {
  validate_name(name)?;
  if size <= 0 {
    return Err(Errno::EINVAL(format!("partition size must be positive, got {size}")));
  }

  let mut device = BlockDevice::open(path, true)?;
  let mut mbr = disk::read_mbr(&mut device)?;

  if disk::partitions(&mut device, &mbr)?.iter().any(|partition| partition.name == name) {
    return Err(Errno::EEXIST(format!("partition '{name}' already exists on {}", path.display())));
  }

  let located = match r#type {
    TYPE_PRIMARY | TYPE_EXTENDED => {
      if r#type == TYPE_EXTENDED {
        if disk::extended(&mbr).is_some() {
          return Err(Errno::EINVAL(String::from("disk already has an extended partition")));
        }
        if size <= Ebr::SIZE as i64 {
          return Err(Errno::EINVAL(format!("extended partition must exceed {} bytes", Ebr::SIZE)));
        }
      }
      let slot = mbr
        .partitions
        .iter()
        .position(|partition| !partition.is_used())
        .ok_or_else(|| Errno::ENOSPC(String::from("all four partition slots are in use")))?;

      let used = mbr
        .partitions
        .iter()
        .filter(|partition| partition.is_used())
        .map(|partition| (partition.start, partition.end()))
        .collect();
      let gap = choose_gap(&free_gaps(used, MBR_RESERVED, mbr.size), size, fit)?;

      let partition = Partition {
        status: STATUS_ACTIVE,
        r#type,
        fit: fit.as_byte(),
        start: gap.start,
        size,
        name: to_fixed(name),
        correlative: NONE,
        id: [0; 4],
      };
      mbr.partitions[slot] = partition.clone();
      disk::write_mbr(&mut device, &mbr)?;
      if r#type == TYPE_EXTENDED {
        disk::write_logicals(&mut device, &partition, Vec::new())?;
      }
      disk::find_partition(&mut device, &mbr, name)?
    }
    TYPE_LOGICAL => {
      let (_, extended) = disk::extended(&mbr)
        .ok_or_else(|| Errno::ENOENT(String::from("logical partitions need an extended partition")))?;
      let extended = extended.clone();
      let ebr_size = Ebr::SIZE as i64;
      let mut logicals = disk::read_logicals(&mut device, &extended)?;

      let mut used: Vec<(i64, i64)> = logicals.iter().map(|(offset, ebr)| (*offset, ebr.end())).collect();
      used.push((extended.start, extended.start + ebr_size));
      let gap = choose_gap(
        &free_gaps(used, extended.start, extended.end()),
        size + ebr_size,
        Fit::from_byte(extended.fit)?,
      )?;

      let ebr = Ebr {
        part_mount: STATUS_ACTIVE,
        fit: fit.as_byte(),
        start: gap.start + ebr_size,
        size,
        next: NONE,
        name: to_fixed(name),
      };
      logicals.push((gap.start, ebr));
      disk::write_logicals(&mut device, &extended, logicals)?;
      disk::find_partition(&mut device, &mbr, name)?
    }
    other => return Err(Errno::EINVAL(format!("invalid partition type '{}'", other as char))),
  };

  device.flush()?;
  info!(
    "fdisk: created {} partition '{name}' at {} ({} bytes) on {}",
    located.r#type as char,
    located.start,
    located.size,
    path.display()
  );
  Ok(located)
}

pub fn delete(path: &Path, name: &str, mode: DeleteMode) -> Result<Located, Errno> {
  let mut device = BlockDevice::open(path, true)?;
  let mut mbr = disk::read_mbr(&mut device)?;
  let located = disk::find_partition(&mut device, &mbr, name)?;

  match located.slot {
    Slot::Primary(index) => {
      if mode == DeleteMode::Full {
        device.zero_range(located.start, located.size)?;
      }
      mbr.partitions[index] = Partition::default();
      disk::write_mbr(&mut device, &mbr)?;
    }
    Slot::Logical(offset) => {
      let (_, extended) = disk::extended(&mbr)
        .ok_or_else(|| Errno::EUCLEAN(String::from("logical partition without extended")))?;
      let extended = extended.clone();
      let logicals = disk::read_logicals(&mut device, &extended)?
        .into_iter()
        .filter(|(ebr_offset, _)| *ebr_offset != offset)
        .collect();
      if mode == DeleteMode::Full {
        device.zero_range(offset, located.end() - offset)?;
      }
      disk::write_logicals(&mut device, &extended, logicals)?;
    }
  }

  device.flush()?;
  info!("fdisk: deleted partition '{name}' ({mode:?}) on {}", path.display());
  Ok(located)
}

/// Grow or shrink a partition by `delta` bytes. `min_size` guards formatted,
/// mounted partitions. Returns the new size.
pub fn add(path: &Path, name: &str, delta: i64, min_size: Option<i64>) -> Result<i64, Errno> {
  let mut device = BlockDevice::open(path, true)?;
  let mut mbr = disk::read_mbr(&mut device)?;
  let located = disk::find_partition(&mut device, &mbr, name)?;

  let new_size = located.size + delta;
  if new_size <= 0 {
    return Err(Errno::EINVAL(format!(
      "partition '{name}' of {} bytes cannot shrink by {}",
      located.size, -delta
    )));
  }
  if let Some(min_size) = min_size {
    if new_size < min_size {
      return Err(Errno::EINVAL(format!(
        "partition '{name}' is mounted and its filesystem needs {min_size} bytes"
      )));
    }
  }

  match located.slot {
    Slot::Primary(index) => {
      let limit = mbr
        .partitions
        .iter()
        .enumerate()
        .filter(|(other, partition)| *other != index && partition.is_used() && partition.start >= located.end())
        .map(|(_, partition)| partition.start)
        .min()
        .unwrap_or(mbr.size);
      if located.start + new_size > limit {
        return Err(Errno::ENOSPC(format!("partition '{name}' cannot grow past {limit}")));
      }
      if located.r#type == TYPE_EXTENDED {
        let logicals = disk::read_logicals(&mut device, &mbr.partitions[index])?;
        let last_end = logicals.iter().map(|(_, ebr)| ebr.end()).max().unwrap_or(0);
        if located.start + new_size < last_end {
          return Err(Errno::EINVAL(format!("extended '{name}' would cut its logical partitions")));
        }
      }
      mbr.partitions[index].size = new_size;
      disk::write_mbr(&mut device, &mbr)?;
    }
    Slot::Logical(offset) => {
      let (_, extended) = disk::extended(&mbr)
        .ok_or_else(|| Errno::EUCLEAN(String::from("logical partition without extended")))?;
      let extended = extended.clone();
      let mut logicals = disk::read_logicals(&mut device, &extended)?;
      let limit = logicals
        .iter()
        .map(|(ebr_offset, _)| *ebr_offset)
        .filter(|ebr_offset| *ebr_offset > offset)
        .min()
        .unwrap_or(extended.end());
      if located.start + new_size > limit {
        return Err(Errno::ENOSPC(format!("logical '{name}' cannot grow past {limit}")));
      }
      for (ebr_offset, ebr) in logicals.iter_mut() {
        if *ebr_offset == offset {
          ebr.size = new_size;
        }
      }
      disk::write_logicals(&mut device, &extended, logicals)?;
    }
  }

  device.flush()?;
  info!("fdisk: partition '{name}' resized {} -> {new_size}", located.size);
  Ok(new_size)
}


// vim:ts=2 sw=2
