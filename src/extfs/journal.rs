use std::fmt::Write as _;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::codec::Record;
use super::fs::ExtFilesystem;
use super::kernel::Errno;
use super::perms::{Credentials, FileMode};
use super::structs::{JournalEntry, SuperBlock, JOURNAL_CAPACITY};
use crate::util::{to_fixed, unixtime_f32};

/// Operations that may appear in a journal.
pub const OPERATIONS: [&str; 14] = [
  "mkdir", "mkfile", "edit", "remove", "rename", "copy", "move", "chmod", "chown", "mkgrp", "rmgrp", "mkusr",
  "rmusr", "chgrp",
];

/// Slots of the layout older images used right before the inode table.
const LEGACY_CAPACITY: i64 = 64;
const PATH_MAX: usize = 31;
const DUMP_WIDTH: usize = 32;

/// Raw copies of the regions a journal may live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRegions {
  /// Legacy placement: the 64 slots ending at the inode table.
  pub candidate1: Vec<u8>,
  /// Current placement: right after the superblock.
  pub preferred: Vec<u8>,
}

fn hexdump(bytes: &[u8]) -> String {
  let mut out = String::new();
  let mut skipping = false;
  for (line, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
    if chunk.iter().all(|&byte| byte == 0) {
      if !skipping {
        out.push_str("*\n");
        skipping = true;
      }
      continue;
    }
    skipping = false;
    let _ = writeln!(out, "{:08x}  {}", line * DUMP_WIDTH, hex::encode(chunk));
  }
  out
}

impl JournalRegions {
  /// Length, SHA-256 and a hex dump of each region. Runs of zero lines
  /// collapse into `*`.
  pub fn summary(&self) -> String {
    let mut out = String::new();
    for (name, bytes) in [("candidate1", &self.candidate1), ("preferred", &self.preferred)] {
      let digest = hex::encode(Sha256::digest(bytes));
      let _ = writeln!(out, "{name}: {} bytes sha256={digest}", bytes.len());
      out.push_str(&hexdump(bytes));
    }
    out
  }
}

/// Longest prefix of `string` that fits in `max` bytes.
fn clip(string: &str, max: usize) -> &str {
  if string.len() <= max {
    return string;
  }
  let mut end = max;
  while !string.is_char_boundary(end) {
    end -= 1;
  }
  &string[..end]
}

/// `value[,r]` payloads of chmod and chown.
fn split_recursive(content: &str) -> (&str, bool) {
  match content.strip_suffix(",r") {
    Some(value) => (value, true),
    None => (content, false),
  }
}

fn plausible(entry: &JournalEntry, last_count: i32) -> bool {
  entry.count > last_count
    && OPERATIONS.contains(&entry.operation().as_str())
    && entry.path.contains(&0)
    && !entry.path().is_empty()
    && entry.date.is_finite()
    && entry.date >= 0.0
}

fn same_entry(a: &JournalEntry, b: &JournalEntry) -> bool {
  a.operation == b.operation && a.path == b.path && a.content == b.content && a.date.to_bits() == b.date.to_bits()
}

impl ExtFilesystem {
  fn journal_start(&self) -> Result<i64, Errno> {
    if self.superblock.fs_type != 3 {
      return Err(Errno::EINVAL(String::from("journal: partition is not ext3")));
    }
    Ok(self.start + SuperBlock::SIZE as i64)
  }

  fn journal_slot(start: i64, slot: i64) -> i64 {
    start + slot * JournalEntry::SIZE as i64
  }

  /// Entries in count order. Ext2 has none.
  pub fn journal(&mut self) -> Result<Vec<JournalEntry>, Errno> {
    if self.superblock.fs_type != 3 {
      return Ok(Vec::new());
    }
    let start = self.journal_start()?;
    let mut entries = Vec::new();
    for slot in 0..JOURNAL_CAPACITY {
      let entry: JournalEntry = self.device.read_record(Self::journal_slot(start, slot))?;
      if entry.count > 0 {
        entries.push(entry);
      }
    }
    entries.sort_by_key(|entry| entry.count);
    Ok(entries)
  }

  fn journaled(&self) -> bool {
    self.superblock.fs_type == 3 && self.journaling
  }

  /// Fail before touching anything when one more entry would not fit.
  pub(super) fn ensure_journal_room(&mut self) -> Result<(), Errno> {
    if !self.journaled() {
      return Ok(());
    }
    if self.journal()?.len() as i64 >= JOURNAL_CAPACITY {
      return Err(Errno::EJOURNALFULL(format!("journal holds {JOURNAL_CAPACITY} entries")));
    }
    Ok(())
  }

  pub(super) fn record(&mut self, operation: &str, path: &str, content: &[u8]) -> Result<(), Errno> {
    if !self.journaled() {
      return Ok(());
    }
    let start = self.journal_start()?;
    let entries = self.journal()?;
    let slot = entries.len() as i64;
    if slot >= JOURNAL_CAPACITY {
      return Err(Errno::EJOURNALFULL(format!("journal holds {JOURNAL_CAPACITY} entries")));
    }

    if path.len() > PATH_MAX {
      warn!("journal: path '{path}' truncated to {PATH_MAX} bytes");
    }
    let mut payload = [0u8; 64];
    let len = content.len().min(payload.len());
    payload[..len].copy_from_slice(&content[..len]);

    let entry = JournalEntry {
      count: entries.last().map(|entry| entry.count).unwrap_or(0) + 1,
      operation: to_fixed(operation),
      path: to_fixed(clip(path, PATH_MAX)),
      content: payload,
      date: unixtime_f32(),
    };
    self.device.write_record(Self::journal_slot(start, slot), &entry)?;
    debug!("journal: #{} {operation} {path}", entry.count);
    Ok(())
  }

  /// Wipe bitmaps, inodes and blocks. The superblock and journal survive.
  pub fn loss(&mut self) -> Result<(), Errno> {
    self.journal_start()?;
    let start = self.superblock.bm_inode_start;
    let end = self.superblock.end();
    self.device.zero_range(start, end - start)?;
    self.device.flush()?;
    warn!("loss: zeroed {} bytes of data region", end - start);
    Ok(())
  }

  /// Rebuild the tree from scratch and replay the journal as root. Returns
  /// the number of entries applied.
  pub fn recover(&mut self) -> Result<usize, Errno> {
    self.journal_start()?;
    let entries = self.journal()?;
    self.reformat()?;

    let journaling = self.journaling;
    self.journaling = false;
    let replayed = self.replay(&entries);
    self.journaling = journaling;
    self.device.flush()?;

    let applied = replayed?;
    info!("recovery: replayed {applied} of {} entries", entries.len());
    Ok(applied)
  }

  fn replay(&mut self, entries: &[JournalEntry]) -> Result<usize, Errno> {
    let root = Credentials::root();
    let mut applied = 0;
    for entry in entries {
      match self.replay_entry(&root, entry) {
        Ok(()) => applied += 1,
        Err(errno @ Errno::EUCLEAN(_)) => return Err(errno),
        Err(errno) => warn!(
          "recovery: skipping #{} {} {}: {errno}",
          entry.count,
          entry.operation(),
          entry.path()
        ),
      }
    }
    Ok(applied)
  }

  fn replay_entry(&mut self, root: &Credentials, entry: &JournalEntry) -> Result<(), Errno> {
    let path = entry.path();
    let content = entry.content();
    match entry.operation().as_str() {
      "mkdir" => self.mkdir(root, &path, true),
      "mkfile" => self.mkfile(root, &path, true, content.as_bytes()),
      "edit" => self.edit(root, &path, content.as_bytes()),
      "remove" => self.remove(root, &path),
      "rename" => self.rename(root, &path, &content),
      "copy" => self.copy(root, &path, &content),
      "move" => self.move_to(root, &path, &content),
      "chmod" => {
        let (ugo, recursive) = split_recursive(&content);
        self.chmod(root, &path, FileMode::parse(ugo)?, recursive)
      }
      "chown" => {
        let (user, recursive) = split_recursive(&content);
        let account = self
          .users()?
          .account(user)
          .ok_or_else(|| Errno::ENOENT(format!("user '{user}' does not exist")))?;
        self.chown(root, &path, (user, account.uid, account.gid), recursive)
      }
      "mkgrp" => self.mkgrp(root, &path).map(drop),
      "rmgrp" => self.rmgrp(root, &path),
      "mkusr" => {
        let (password, group) = content
          .split_once(',')
          .ok_or_else(|| Errno::EINVAL(format!("mkusr entry for '{path}' lacks a group")))?;
        self.mkusr(root, &path, password, group).map(drop)
      }
      "rmusr" => self.rmusr(root, &path),
      "chgrp" => self.chgrp(root, &path, &content),
      operation => Err(Errno::EINVAL(format!("unknown journal operation '{operation}'"))),
    }
  }

  pub fn journal_regions(&mut self) -> Result<JournalRegions, Errno> {
    let start = self.journal_start()?;
    let preferred = self.device.read_at(start, (JOURNAL_CAPACITY * JournalEntry::SIZE as i64) as usize)?;

    let legacy_len = LEGACY_CAPACITY * JournalEntry::SIZE as i64;
    let legacy_start = self.superblock.inode_start - legacy_len;
    let candidate1 = if legacy_start >= self.start + SuperBlock::SIZE as i64 {
      self.device.read_at(legacy_start, legacy_len as usize)?
    } else {
      Vec::new()
    };
    Ok(JournalRegions { candidate1, preferred })
  }

  /// Collect plausible entries from both regions and rewrite them densely,
  /// renumbered from 1, into the current region.
  pub fn repair_journal(&mut self) -> Result<usize, Errno> {
    let start = self.journal_start()?;
    let regions = self.journal_regions()?;

    let mut found: Vec<JournalEntry> = Vec::new();
    for (legacy, bytes) in [(false, &regions.preferred), (true, &regions.candidate1)] {
      let mut last_count = 0;
      for chunk in bytes.chunks_exact(JournalEntry::SIZE) {
        let entry = JournalEntry::decode(chunk)?;
        if !plausible(&entry, last_count) {
          continue;
        }
        last_count = entry.count;
        // the legacy region may hold copies of current entries
        if legacy && found.iter().any(|kept| same_entry(kept, &entry)) {
          continue;
        }
        found.push(entry);
      }
    }
    found.sort_by(|a, b| a.date.total_cmp(&b.date));
    found.truncate(JOURNAL_CAPACITY as usize);

    self.device.zero_range(start, JOURNAL_CAPACITY * JournalEntry::SIZE as i64)?;
    for (slot, entry) in found.iter_mut().enumerate() {
      entry.count = slot as i32 + 1;
      self.device.write_record(Self::journal_slot(start, slot as i64), entry)?;
    }
    self.device.flush()?;

    info!("repair: kept {} journal entries", found.len());
    Ok(found.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extfs::fs::tests::formatted;
  use crate::extfs::users::{USERS_DEFAULT, USERS_PATH};

  #[test]
  fn records_count_upwards_on_ext3_only() {
    let (mut ext3, ext3_path) = formatted(3);
    let (mut ext2, ext2_path) = formatted(2);
    let root = Credentials::root();

    for fs in [&mut ext3, &mut ext2] {
      fs.mkdir(&root, "/a", false).unwrap();
      fs.mkfile(&root, "/a/f", false, &vec![b'q'; 100]).unwrap();
      fs.rename(&root, "/a/f", "g").unwrap();
    }
    assert!(ext2.journal().unwrap().is_empty());

    let journal = ext3.journal().unwrap();
    let counts: Vec<i32> = journal.iter().map(|entry| entry.count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert_eq!(journal[1].operation(), "mkfile");
    assert_eq!(journal[1].content(), "q".repeat(64));
    assert_eq!(journal[2].path(), "/a/f");
    assert_eq!(journal[2].content(), "g");

    drop(ext3);
    drop(ext2);
    std::fs::remove_file(ext3_path).unwrap();
    std::fs::remove_file(ext2_path).unwrap();
  }

  #[test]
  fn long_paths_are_clipped() {
    assert_eq!(clip("abc", 31), "abc");
    assert_eq!(clip(&"x".repeat(40), 31).len(), 31);
    assert_eq!(clip("aé", 2), "a");
    assert_eq!(split_recursive("755,r"), ("755", true));
    assert_eq!(split_recursive("alice"), ("alice", false));
  }

  #[test]
  fn full_journal_rejects_without_side_effects() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();
    for i in 0..JOURNAL_CAPACITY {
      fs.mkdir(&root, &format!("/d{i}"), false).unwrap();
    }
    let free_inodes = fs.superblock().free_inodes_count;

    assert!(matches!(fs.mkdir(&root, "/extra", false), Err(Errno::EJOURNALFULL(_))));
    assert!(matches!(fs.mkgrp(&root, "late"), Err(Errno::EJOURNALFULL(_))));
    assert_eq!(fs.superblock().free_inodes_count, free_inodes);
    assert!(fs.resolve("/extra").is_err());
    // reads still work
    assert!(fs.read_file(&root, USERS_PATH).is_ok());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn loss_then_recovery_restores_the_tree() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();
    fs.mkdir(&root, "/a/b/c", true).unwrap();
    fs.mkfile(&root, "/a/b/c/f.txt", false, b"01234567890123456789").unwrap();
    fs.mkgrp(&root, "devs").unwrap();
    fs.mkusr(&root, "alice", "abc", "devs").unwrap();
    fs.chown(&root, "/a", ("alice", 2, 2), true).unwrap();
    fs.chmod(&root, "/a/b", FileMode::parse("750").unwrap(), false).unwrap();
    let users_before = fs.read_file(&root, USERS_PATH).unwrap();

    fs.loss().unwrap();
    assert!(matches!(fs.resolve("/a"), Err(Errno::EUCLEAN(_))));
    assert!(matches!(fs.mkdir(&root, "/z", false), Err(Errno::EUCLEAN(_))));
    assert_eq!(fs.journal().unwrap().len(), 6);

    assert_eq!(fs.recover().unwrap(), 6);
    assert_eq!(fs.read_file(&root, "/a/b/c/f.txt").unwrap(), b"01234567890123456789");
    assert_eq!(fs.read_file(&root, USERS_PATH).unwrap(), users_before);
    let (_, a) = fs.resolve("/a").unwrap();
    assert_eq!((a.uid, a.gid), (2, 2));
    let (_, b) = fs.resolve("/a/b").unwrap();
    assert_eq!(&b.perm, b"750");
    // replay does not append to the journal
    assert_eq!(fs.journal().unwrap().len(), 6);

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn recovery_is_idempotent() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();
    fs.mkdir(&root, "/x/y", true).unwrap();
    fs.mkfile(&root, "/x/y/z", false, b"zz").unwrap();
    fs.mkdir(&root, "/w", false).unwrap();
    fs.move_to(&root, "/x/y", "/w").unwrap();

    fs.recover().unwrap();
    let first = (fs.list("/").unwrap(), fs.list("/w/y").unwrap(), fs.superblock().clone());
    fs.recover().unwrap();
    let second = (fs.list("/").unwrap(), fs.list("/w/y").unwrap(), fs.superblock().clone());

    let names = |nodes: &[crate::extfs::fs::FileNode]| nodes.iter().map(|node| node.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&first.0), names(&second.0));
    assert_eq!(names(&first.1), vec!["z"]);
    assert_eq!(first.2.free_inodes_count, second.2.free_inodes_count);
    assert_eq!(first.2.free_blocks_count, second.2.free_blocks_count);

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn recovery_on_a_fresh_image_keeps_users() {
    let (mut fs, path) = formatted(3);
    assert_eq!(fs.recover().unwrap(), 0);
    assert_eq!(fs.read_file(&Credentials::root(), USERS_PATH).unwrap(), USERS_DEFAULT.as_bytes());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn ext2_has_no_loss_or_recovery() {
    let (mut fs, path) = formatted(2);
    assert!(matches!(fs.loss(), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.recover(), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.journal_regions(), Err(Errno::EINVAL(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn repair_drops_garbage_and_compacts() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();
    fs.mkdir(&root, "/one", false).unwrap();
    fs.mkdir(&root, "/two", false).unwrap();
    fs.mkdir(&root, "/three", false).unwrap();

    // scribble over the middle slot
    let start = fs.start() + SuperBlock::SIZE as i64;
    let garbage = JournalEntry {
      count: 2,
      operation: to_fixed("format"),
      path: [b'x'; 32],
      content: [0; 64],
      date: 1.0,
    };
    fs.device.write_record(start + JournalEntry::SIZE as i64, &garbage).unwrap();

    assert_eq!(fs.repair_journal().unwrap(), 2);
    let journal = fs.journal().unwrap();
    assert_eq!(journal.iter().map(|entry| entry.count).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(journal[0].path(), "/one");
    assert_eq!(journal[1].path(), "/three");

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn regions_dump() {
    let (mut fs, path) = formatted(3);
    fs.mkdir(&Credentials::root(), "/dumped", false).unwrap();
    let regions = fs.journal_regions().unwrap();
    assert_eq!(regions.preferred.len(), 5700);

    let summary = regions.summary();
    let digest = hex::encode(Sha256::digest(&regions.preferred));
    assert!(summary.contains(&format!("preferred: 5700 bytes sha256={digest}")));
    assert!(summary.contains(&hex::encode(b"mkdir")));
    assert!(summary.contains("*\n"));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }
}

// vim:ts=2 sw=2
