use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;

use super::codec::Record;
use super::device::BlockDevice;
use super::disk::{self, Slot};
use super::kernel::Errno;
use super::structs::{Ebr, SuperBlock, MAGIC, STATUS_ACTIVE, STATUS_MOUNTED};

/// A mounted partition. Only the registry hands these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPartition {
  pub id: String,
  pub path: PathBuf,
  pub name: String,
  pub start: i64,
  pub size: i64,
  pub correlative: i64,
  pub letter: char,
  /// 2 or 3 once formatted, 0 before.
  pub fs_type: i64,
  pub slot: Slot,
}

#[derive(Debug, Default)]
pub struct MountRegistry {
  carnet_suffix: String,
  mounted: Vec<MountedPartition>,
  letters: BTreeMap<PathBuf, char>,
  correlatives: BTreeMap<PathBuf, i64>,
}

fn disk_key(path: &Path) -> PathBuf {
  std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

impl MountRegistry {
  pub fn new(carnet_suffix: &str) -> Self {
    Self {
      carnet_suffix: carnet_suffix.to_owned(),
      ..Default::default()
    }
  }

  pub fn list(&self) -> &[MountedPartition] {
    &self.mounted
  }

  pub fn first(&self) -> Option<&MountedPartition> {
    self.mounted.first()
  }

  /// Case-insensitive lookup.
  pub fn get(&self, id: &str) -> Option<&MountedPartition> {
    self.mounted.iter().find(|mounted| mounted.id.eq_ignore_ascii_case(id))
  }

  pub fn get_mut(&mut self, id: &str) -> Option<&mut MountedPartition> {
    self.mounted.iter_mut().find(|mounted| mounted.id.eq_ignore_ascii_case(id))
  }

  pub fn find(&self, path: &Path, name: &str) -> Option<&MountedPartition> {
    let key = disk_key(path);
    self.mounted.iter().find(|mounted| disk_key(&mounted.path) == key && mounted.name == name)
  }

  /// Mounted partitions of `path` overlapping `[start, end)`.
  pub fn within(&self, path: &Path, start: i64, end: i64) -> Vec<&MountedPartition> {
    let key = disk_key(path);
    self
      .mounted
      .iter()
      .filter(|mounted| disk_key(&mounted.path) == key && mounted.start < end && start < mounted.start + mounted.size)
      .collect()
  }

  pub fn mount(&mut self, path: &Path, name: &str) -> Result<MountedPartition, Errno> {
    if self.find(path, name).is_some() {
      return Err(Errno::EEXIST(format!("partition '{name}' of {} is already mounted", path.display())));
    }

    let mut device = BlockDevice::open(path, true)?;
    let mut mbr = disk::read_mbr(&mut device)?;
    let located = disk::find_partition(&mut device, &mbr, name)?;

    let key = disk_key(path);
    let letter = match self.letters.get(&key) {
      Some(letter) => *letter,
      None => {
        let index = self.letters.len() as u8;
        if index >= 26 {
          return Err(Errno::ENOSPC(String::from("no disk letters left")));
        }
        (b'A' + index) as char
      }
    };
    let correlative = self.correlatives.get(&key).copied().unwrap_or(0) + 1;
    if correlative > 9 {
      return Err(Errno::ENOSPC(format!("{}: mount correlatives exhausted", path.display())));
    }
    let id = format!("{}{correlative}{letter}", self.carnet_suffix);

    match located.slot {
      Slot::Primary(index) => {
        let partition = &mut mbr.partitions[index];
        partition.status = STATUS_MOUNTED;
        partition.correlative = correlative;
        partition.id.copy_from_slice(&id.as_bytes()[..4]);
        disk::write_mbr(&mut device, &mbr)?;
      }
      Slot::Logical(offset) => {
        let mut ebr: Ebr = device.read_record(offset)?;
        ebr.part_mount = STATUS_MOUNTED;
        device.write_record(offset, &ebr)?;
      }
    }

    let fs_type = if located.size >= SuperBlock::SIZE as i64 {
      let superblock: SuperBlock = device.read_record(located.start)?;
      if superblock.magic == MAGIC { superblock.fs_type } else { 0 }
    } else {
      0
    };
    device.flush()?;

    self.letters.insert(key.clone(), letter);
    self.correlatives.insert(key, correlative);
    let mounted = MountedPartition {
      id: id.clone(),
      path: path.to_owned(),
      name: name.to_owned(),
      start: located.start,
      size: located.size,
      correlative,
      letter,
      fs_type,
      slot: located.slot,
    };
    self.mounted.push(mounted.clone());
    info!("mount: {} '{name}' as {id}", path.display());

    Ok(mounted)
  }

  /// Drop `id` from the registry and clear its on-disk mount state. The
  /// entry is gone even when the disk could not be updated.
  pub fn unmount(&mut self, id: &str) -> Result<MountedPartition, Errno> {
    let index = self
      .mounted
      .iter()
      .position(|mounted| mounted.id.eq_ignore_ascii_case(id))
      .ok_or_else(|| Errno::ENOENT(format!("no partition mounted as '{id}'")))?;
    let mounted = self.mounted.remove(index);

    Self::clear_mount_state(&mounted)
      .map_err(|errno| errno.context(&format!("unmount {}: on-disk state not cleared", mounted.id)))?;
    info!("unmount: {}", mounted.id);
    Ok(mounted)
  }

  fn clear_mount_state(mounted: &MountedPartition) -> Result<(), Errno> {
    let mut device = BlockDevice::open(&mounted.path, true)?;
    match mounted.slot {
      Slot::Primary(index) => {
        let mut mbr = disk::read_mbr(&mut device)?;
        let partition = &mut mbr.partitions[index];
        partition.status = STATUS_ACTIVE;
        partition.id = [0; 4];
        disk::write_mbr(&mut device, &mbr)?;
      }
      Slot::Logical(offset) => {
        let mut ebr: Ebr = device.read_record(offset)?;
        ebr.part_mount = STATUS_ACTIVE;
        device.write_record(offset, &ebr)?;
      }
    }
    device.flush()
  }
}


// vim:ts=2 sw=2
