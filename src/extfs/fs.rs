use fancy_regex::Regex;
use log::debug;
use serde::Serialize;

use super::codec::Record;
use super::device::BlockDevice;
use super::kernel::Errno;
use super::mount::MountedPartition;
use super::perms::{self, Access, Credentials, FileMode};
use super::structs::{
  FolderBlock, FolderEntry, Inode, SuperBlock, INODE_FILE, INODE_FOLDER, MAGIC, NAME_MAX, NONE,
};
use super::users::Users;
use crate::util::{fixedpoint, human_time, unixtime};

pub const ROOT_INODE: i64 = 0;
pub const DEFAULT_PERM: [u8; 3] = *b"664";

/// An open, formatted partition. The backing file is closed on drop.
#[derive(Debug)]
pub struct ExtFilesystem {
  pub(super) device: BlockDevice,
  pub(super) superblock: SuperBlock,
  pub(super) start: i64,
  pub(super) size: i64,
  pub(super) journaling: bool,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
  pub name: String,
  pub r#type: String,
  pub size: i64,
  pub perm: String,
  pub mode: String,
  pub uid: i32,
  pub gid: i32,
  pub owner: String,
  pub group: String,
  pub mtime: String,
}

/// In-memory copy of a subtree, used to copy between handles.
#[derive(Debug, Clone)]
pub struct Snapshot {
  pub name: String,
  pub perm: [u8; 3],
  pub kind: SnapshotKind,
}

#[derive(Debug, Clone)]
pub enum SnapshotKind {
  File(Vec<u8>),
  Folder(Vec<Snapshot>),
}

pub fn split_path(pathname: &str) -> Result<(Vec<String>, String), Errno> {
  // Guard for empty `pathname`
  match pathname {
    "" => return Err(Errno::EINVAL(String::from("fs::split_path: zero-length path"))),
    pathname if !pathname.starts_with('/') => {
      return Err(Errno::EINVAL(format!("fs::split_path: path must start with '/': {pathname}")))
    }
    _ => (),
  };

  // Replace all adjacent slashes
  let pathname = fixedpoint(|pathname: &String| pathname.replace("//", "/"), pathname.to_owned());

  // Base case: root directory
  if pathname == "/" {
    return Ok((Vec::new(), String::from("/")));
  }

  let mut pieces: Vec<String> = pathname
    .split('/')
    .filter(|piece| !piece.is_empty())
    .map(ToOwned::to_owned)
    .collect();
  let final_component = pieces
    .pop()
    .ok_or_else(|| Errno::EINVAL(String::from("fs::split_path: no final component")))?;

  Ok((pieces, final_component))
}

/// Every component of an absolute path; empty for `/`.
pub fn components(pathname: &str) -> Result<Vec<String>, Errno> {
  let (mut everything_else, final_component) = split_path(pathname)?;
  if final_component != "/" {
    everything_else.push(final_component);
  }
  Ok(everything_else)
}

pub fn normalize(pathname: &str) -> Result<String, Errno> {
  Ok(format!("/{}", components(pathname)?.join("/")))
}

pub fn validate_name(name: &str) -> Result<(), Errno> {
  if name.is_empty() || name == "." || name == ".." || name.contains('/') {
    return Err(Errno::EINVAL(format!("invalid name '{name}'")));
  }
  if name.len() > NAME_MAX {
    return Err(Errno::ENAMETOOLONG(format!("'{name}' exceeds {NAME_MAX} bytes")));
  }
  Ok(())
}

/// Translate a `*`/`?` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, Errno> {
  let mut regex = String::from("^");
  for character in pattern.chars() {
    match character {
      '*' => regex.push_str(".*"),
      '?' => regex.push('.'),
      character if "\\.+()[]{}^$|".contains(character) => {
        regex.push('\\');
        regex.push(character);
      }
      character => regex.push(character),
    }
  }
  regex.push('$');
  Regex::new(&regex).map_err(|error| Errno::EINVAL(format!("invalid pattern '{pattern}': {error}")))
}

impl ExtFilesystem {
  pub fn open(mounted: &MountedPartition) -> Result<Self, Errno> {
    let device = BlockDevice::open(&mounted.path, true)?;
    Self::load(device, mounted.start, mounted.size)
  }

  pub(super) fn load(mut device: BlockDevice, start: i64, size: i64) -> Result<Self, Errno> {
    if size < SuperBlock::SIZE as i64 {
      return Err(Errno::EUCLEAN(String::from("partition is not formatted")));
    }
    let superblock: SuperBlock = device.read_record(start)?;
    if superblock.magic != MAGIC {
      return Err(Errno::EUCLEAN(format!(
        "partition is not formatted (magic {:#x})",
        superblock.magic
      )));
    }
    if superblock.bm_inode_start < start || superblock.end() > start + size {
      return Err(Errno::EUCLEAN(String::from("superblock regions fall outside the partition")));
    }
    debug!("fs: opened ext{} at {start} ({} inodes)", superblock.fs_type, superblock.inodes_count);

    Ok(Self { device, superblock, start, size, journaling: true })
  }

  pub fn superblock(&self) -> &SuperBlock {
    &self.superblock
  }

  pub fn fs_type(&self) -> i64 {
    self.superblock.fs_type
  }

  pub fn start(&self) -> i64 {
    self.start
  }

  pub fn size(&self) -> i64 {
    self.size
  }

  pub fn set_journaling(&mut self, journaling: bool) {
    self.journaling = journaling;
  }

  /// Root inode; anything else than a folder means the data region is gone.
  pub fn root(&mut self) -> Result<Inode, Errno> {
    let root = self.read_inode(ROOT_INODE)?;
    if !root.is_folder() {
      return Err(Errno::EUCLEAN(String::from("filesystem damaged: root is not a folder, run recovery")));
    }
    Ok(root)
  }

  /// Live entries in slot order, `.` and `..` included.
  pub fn entries(&mut self, folder: &Inode) -> Result<Vec<(String, i64)>, Errno> {
    let mut entries = Vec::new();
    for block in self.folder_blocks(folder)? {
      let block: FolderBlock = self.read_block(block)?;
      for entry in block.entries.iter().filter(|entry| !entry.is_free()) {
        entries.push((entry.name(), entry.inode));
      }
    }
    Ok(entries)
  }

  /// Entries without `.` and `..`.
  pub fn children(&mut self, folder: &Inode) -> Result<Vec<(String, i64)>, Errno> {
    Ok(
      self
        .entries(folder)?
        .into_iter()
        .filter(|(name, _)| name != "." && name != "..")
        .collect(),
    )
  }

  pub fn lookup(&mut self, folder: &Inode, name: &str) -> Result<Option<i64>, Errno> {
    if !folder.is_folder() {
      return Err(Errno::ENOTDIR(format!("'{name}': parent is not a folder")));
    }
    Ok(
      self
        .entries(folder)?
        .into_iter()
        .find(|(entry, _)| entry == name)
        .map(|(_, inode)| inode),
    )
  }

  pub fn resolve(&mut self, pathname: &str) -> Result<(i64, Inode), Errno> {
    let mut index = ROOT_INODE;
    let mut inode = self.root()?;
    for name in components(pathname)? {
      if !inode.is_folder() {
        return Err(Errno::ENOTDIR(format!("{pathname}: '{name}' is below a file")));
      }
      index = self
        .lookup(&inode, &name)?
        .ok_or_else(|| Errno::ENOENT(format!("{pathname}: no such file or folder")))?;
      inode = self.read_inode(index)?;
    }
    Ok((index, inode))
  }

  /// Parent folder of `pathname` plus the final name. Fails on `/` and on
  /// a trailing `.` or `..`.
  pub fn resolve_parent(&mut self, pathname: &str) -> Result<(i64, Inode, String), Errno> {
    let (everything_else, final_component) = split_path(pathname)?;
    if final_component == "/" {
      return Err(Errno::EINVAL(String::from("the root folder has no parent")));
    }
    if final_component == "." || final_component == ".." {
      return Err(Errno::EINVAL(format!("{pathname}: cannot end in '{final_component}'")));
    }
    let (index, inode) = self.resolve(&format!("/{}", everything_else.join("/")))?;
    if !inode.is_folder() {
      return Err(Errno::ENOTDIR(format!("{pathname}: parent is not a folder")));
    }
    Ok((index, inode, final_component))
  }

  fn write_entry(&mut self, folder: &Inode, name: &str, entry: FolderEntry) -> Result<i64, Errno> {
    for block_index in self.folder_blocks(folder)? {
      let mut block: FolderBlock = self.read_block(block_index)?;
      if let Some(slot) = block.entries.iter().position(|slot| !slot.is_free() && slot.name() == name) {
        let previous = block.entries[slot].inode;
        block.entries[slot] = entry;
        self.write_block(block_index, &block)?;
        return Ok(previous);
      }
    }
    Err(Errno::ENOENT(format!("'{name}' not found in folder")))
  }

  pub fn add_entry(&mut self, folder_index: i64, folder: &mut Inode, name: &str, child: i64) -> Result<(), Errno> {
    let now = unixtime();
    let blocks = self.folder_blocks(folder)?;
    for &block_index in &blocks {
      let mut block: FolderBlock = self.read_block(block_index)?;
      if let Some(slot) = block.entries.iter().position(FolderEntry::is_free) {
        block.entries[slot] = FolderEntry::new(name, child);
        self.write_block(block_index, &block)?;
        folder.touch(now);
        return self.write_inode(folder_index, folder);
      }
    }

    let block_index = match self.ensure_block(folder, blocks.len()) {
      Ok(block_index) => block_index,
      Err(errno) => {
        // keep any pointer block that did get allocated reachable
        self.write_inode(folder_index, folder)?;
        return Err(errno);
      }
    };
    let mut block = FolderBlock::default();
    block.entries[0] = FolderEntry::new(name, child);
    self.write_block(block_index, &block)?;
    folder.touch(now);
    self.write_inode(folder_index, folder)
  }

  pub fn remove_entry(&mut self, folder_index: i64, folder: &mut Inode, name: &str) -> Result<i64, Errno> {
    let child = self.write_entry(folder, name, FolderEntry::default())?;
    folder.touch(unixtime());
    self.write_inode(folder_index, folder)?;
    Ok(child)
  }

  fn release(&mut self, index: i64) -> Result<(), Errno> {
    let mut inode = self.read_inode(index)?;
    self.free_blocks(&mut inode)?;
    self.free_inode(index)
  }

  /// Allocate and link a new node under `parent`; undone on failure.
  pub(super) fn create_node(
    &mut self,
    credentials: &Credentials,
    parent_index: i64,
    parent: &mut Inode,
    name: &str,
    r#type: u8,
    perm: [u8; 3],
    content: &[u8],
  ) -> Result<i64, Errno> {
    validate_name(name)?;
    perms::check(credentials, parent, Access::Write, name)?;
    if self.lookup(parent, name)?.is_some() {
      return Err(Errno::EEXIST(format!("'{name}' already exists")));
    }

    let index = self.alloc_inode()?;
    let mut inode = Inode::new(r#type, credentials.uid, credentials.gid, perm, unixtime());
    let filled = if r#type == INODE_FOLDER {
      self.alloc_block().and_then(|block| {
        inode.block[0] = block;
        self.write_block(block, &FolderBlock::with_links(index, parent_index))
      })
    } else {
      self.write_content(&mut inode, content)
    };
    let linked = filled
      .and_then(|_| self.write_inode(index, &inode))
      .and_then(|_| self.add_entry(parent_index, parent, name, index));

    if let Err(errno) = linked {
      self.free_blocks(&mut inode)?;
      self.free_inode(index)?;
      return Err(errno);
    }
    debug!("fs: created {} '{name}' as inode #{index}", if r#type == INODE_FOLDER { "folder" } else { "file" });
    Ok(index)
  }

  /// Undo nodes created by a multi-step operation, newest first.
  fn discard(&mut self, created: Vec<(i64, String, i64)>) -> Result<(), Errno> {
    for (parent_index, name, child) in created.into_iter().rev() {
      let mut parent = self.read_inode(parent_index)?;
      self.remove_entry(parent_index, &mut parent, &name)?;
      self.release(child)?;
    }
    Ok(())
  }

  /// Walk to the folder holding the last component, creating missing
  /// ancestors when `parents` is set.
  fn prepare_parent(
    &mut self,
    credentials: &Credentials,
    pathname: &str,
    parents: bool,
    created: &mut Vec<(i64, String, i64)>,
  ) -> Result<(i64, Inode, String), Errno> {
    let mut names = components(pathname)?;
    let last = names
      .pop()
      .ok_or_else(|| Errno::EEXIST(String::from("the root folder already exists")))?;

    let mut index = ROOT_INODE;
    let mut inode = self.root()?;
    for name in names {
      match self.lookup(&inode, &name)? {
        Some(child) => {
          index = child;
          inode = self.read_inode(child)?;
          if !inode.is_folder() {
            return Err(Errno::ENOTDIR(format!("{pathname}: '{name}' is not a folder")));
          }
        }
        None if parents => {
          let child = self.create_node(credentials, index, &mut inode, &name, INODE_FOLDER, DEFAULT_PERM, &[])?;
          created.push((index, name, child));
          index = child;
          inode = self.read_inode(child)?;
        }
        None => return Err(Errno::ENOENT(format!("{pathname}: folder '{name}' does not exist"))),
      }
    }
    Ok((index, inode, last))
  }

  fn create_path(
    &mut self,
    credentials: &Credentials,
    pathname: &str,
    parents: bool,
    r#type: u8,
    content: &[u8],
  ) -> Result<i64, Errno> {
    let mut created = Vec::new();
    let result = self
      .prepare_parent(credentials, pathname, parents, &mut created)
      .and_then(|(parent_index, mut parent, name)| {
        self.create_node(credentials, parent_index, &mut parent, &name, r#type, DEFAULT_PERM, content)
      });
    if result.is_err() {
      self.discard(created)?;
    }
    result
  }

  pub fn mkdir(&mut self, credentials: &Credentials, pathname: &str, parents: bool) -> Result<(), Errno> {
    self.ensure_journal_room()?;
    self.create_path(credentials, pathname, parents, INODE_FOLDER, &[])?;
    self.record("mkdir", pathname, b"")
  }

  pub fn mkfile(&mut self, credentials: &Credentials, pathname: &str, parents: bool, content: &[u8]) -> Result<(), Errno> {
    self.ensure_journal_room()?;
    self.create_path(credentials, pathname, parents, INODE_FILE, content)?;
    self.record("mkfile", pathname, content)
  }

  pub fn read_file(&mut self, credentials: &Credentials, pathname: &str) -> Result<Vec<u8>, Errno> {
    let (index, mut inode) = self.resolve(pathname)?;
    if inode.is_folder() {
      return Err(Errno::EISDIR(format!("{pathname}: is a folder")));
    }
    perms::check(credentials, &inode, Access::Read, pathname)?;
    let content = self.read_content(&inode)?;
    inode.atime = unixtime();
    self.write_inode(index, &inode)?;
    Ok(content)
  }

  pub fn edit(&mut self, credentials: &Credentials, pathname: &str, content: &[u8]) -> Result<(), Errno> {
    let (index, mut inode) = self.resolve(pathname)?;
    if inode.is_folder() {
      return Err(Errno::EISDIR(format!("{pathname}: is a folder")));
    }
    perms::check(credentials, &inode, Access::Read, pathname)?;
    perms::check(credentials, &inode, Access::Write, pathname)?;
    self.ensure_journal_room()?;
    self.replace_content(index, &mut inode, content)?;
    self.record("edit", pathname, content)
  }

  /// Swap a file's content. New blocks are written first so a failure keeps
  /// the old content.
  pub(super) fn replace_content(&mut self, index: i64, inode: &mut Inode, content: &[u8]) -> Result<(), Errno> {
    let mut staged = inode.clone();
    staged.block = [NONE; 15];
    self.write_content(&mut staged, content)?;
    self.free_blocks(inode)?;
    inode.block = staged.block;
    inode.size = staged.size;
    inode.touch(unixtime());
    self.write_inode(index, inode)
  }

  /// `(index, inode)` of a node and every descendant, parents first.
  pub fn subtree(&mut self, index: i64) -> Result<Vec<(i64, Inode)>, Errno> {
    let mut nodes = Vec::new();
    let mut stack = vec![index];
    while let Some(current) = stack.pop() {
      let inode = self.read_inode(current)?;
      if inode.is_folder() {
        let children = self.children(&inode)?;
        stack.extend(children.into_iter().rev().map(|(_, child)| child));
      }
      nodes.push((current, inode));
    }
    Ok(nodes)
  }

  pub fn remove(&mut self, credentials: &Credentials, pathname: &str) -> Result<(), Errno> {
    let (parent_index, mut parent, name) = self.resolve_parent(pathname)?;
    let index = self
      .lookup(&parent, &name)?
      .ok_or_else(|| Errno::ENOENT(format!("{pathname}: no such file or folder")))?;
    let nodes = self.subtree(index)?;
    for (_, inode) in &nodes {
      perms::check(credentials, inode, Access::Write, pathname)?;
    }
    self.ensure_journal_room()?;

    self.remove_entry(parent_index, &mut parent, &name)?;
    for (node, _) in nodes.into_iter().rev() {
      self.release(node)?;
    }
    self.record("remove", pathname, b"")
  }

  pub fn rename(&mut self, credentials: &Credentials, pathname: &str, new_name: &str) -> Result<(), Errno> {
    validate_name(new_name)?;
    let (parent_index, mut parent, name) = self.resolve_parent(pathname)?;
    let index = self
      .lookup(&parent, &name)?
      .ok_or_else(|| Errno::ENOENT(format!("{pathname}: no such file or folder")))?;
    let mut inode = self.read_inode(index)?;
    perms::check(credentials, &inode, Access::Write, pathname)?;
    if self.lookup(&parent, new_name)?.is_some() {
      return Err(Errno::EEXIST(format!("'{new_name}' already exists next to {pathname}")));
    }
    self.ensure_journal_room()?;

    self.write_entry(&parent, &name, FolderEntry::new(new_name, index))?;
    let now = unixtime();
    parent.touch(now);
    self.write_inode(parent_index, &parent)?;
    inode.ctime = now;
    self.write_inode(index, &inode)?;

    self.record("rename", pathname, new_name.as_bytes())
  }

  /// Read a subtree into memory. Unreadable descendants are skipped.
  pub fn snapshot(&mut self, credentials: &Credentials, pathname: &str) -> Result<Snapshot, Errno> {
    let (_, inode) = self.resolve(pathname)?;
    perms::check(credentials, &inode, Access::Read, pathname)?;
    let (_, name) = split_path(pathname)?;
    self.snapshot_node(credentials, name, inode)
  }

  fn snapshot_node(&mut self, credentials: &Credentials, name: String, inode: Inode) -> Result<Snapshot, Errno> {
    let kind = if inode.is_folder() {
      let mut children = Vec::new();
      for (child_name, child) in self.children(&inode)? {
        let child_inode = self.read_inode(child)?;
        if !perms::permits(credentials, &child_inode, Access::Read) {
          debug!("fs: copy skips unreadable '{child_name}'");
          continue;
        }
        children.push(self.snapshot_node(credentials, child_name, child_inode)?);
      }
      SnapshotKind::Folder(children)
    } else {
      SnapshotKind::File(self.read_content(&inode)?)
    };
    Ok(Snapshot { name, perm: inode.perm, kind })
  }

  /// Write a snapshot below `parent_index`, owned by `credentials`.
  /// Partial results are removed on failure.
  pub fn materialize(&mut self, credentials: &Credentials, parent_index: i64, snapshot: &Snapshot) -> Result<i64, Errno> {
    let mut created = Vec::new();
    let result = self.materialize_node(credentials, credentials, parent_index, snapshot, &mut created);
    if result.is_err() {
      self.discard(created)?;
    }
    result
  }

  fn materialize_node(
    &mut self,
    owner: &Credentials,
    writer: &Credentials,
    parent_index: i64,
    snapshot: &Snapshot,
    created: &mut Vec<(i64, String, i64)>,
  ) -> Result<i64, Errno> {
    let mut parent = self.read_inode(parent_index)?;
    let (r#type, content) = match &snapshot.kind {
      SnapshotKind::File(content) => (INODE_FILE, content.as_slice()),
      SnapshotKind::Folder(_) => (INODE_FOLDER, &[][..]),
    };
    let index = self.create_node(writer, parent_index, &mut parent, &snapshot.name, r#type, snapshot.perm, content)?;
    created.push((parent_index, snapshot.name.clone(), index));

    if writer != owner {
      let mut inode = self.read_inode(index)?;
      inode.uid = owner.uid;
      inode.gid = owner.gid;
      self.write_inode(index, &inode)?;
    }
    if let SnapshotKind::Folder(children) = &snapshot.kind {
      // the copied folder's own mode must not block its children
      for child in children {
        self.materialize_node(owner, &Credentials::root(), index, child, created)?;
      }
    }
    Ok(index)
  }

  fn destination_folder(&mut self, credentials: &Credentials, destination: &str) -> Result<(i64, Inode), Errno> {
    let (index, inode) = self.resolve(destination)?;
    if !inode.is_folder() {
      return Err(Errno::ENOTDIR(format!("{destination}: destination is not a folder")));
    }
    perms::check(credentials, &inode, Access::Write, destination)?;
    Ok((index, inode))
  }

  /// True when `folder` is `ancestor` or lies below it.
  fn is_within(&mut self, folder: i64, ancestor: i64) -> Result<bool, Errno> {
    let mut current = folder;
    for _ in 0..self.superblock.inodes_count {
      if current == ancestor {
        return Ok(true);
      }
      if current == ROOT_INODE {
        return Ok(false);
      }
      let inode = self.read_inode(current)?;
      current = self
        .lookup(&inode, "..")?
        .ok_or_else(|| Errno::EUCLEAN(format!("folder #{current} has no '..'")))?;
    }
    Err(Errno::EUCLEAN(String::from("'..' links form a cycle")))
  }

  pub fn copy(&mut self, credentials: &Credentials, pathname: &str, destination: &str) -> Result<(), Errno> {
    let (source_index, _) = self.resolve(pathname)?;
    if components(pathname)?.is_empty() {
      return Err(Errno::EINVAL(String::from("cannot copy the root folder")));
    }
    let (destination_index, destination_inode) = self.destination_folder(credentials, destination)?;
    let (_, name) = split_path(pathname)?;
    if name == "." || name == ".." {
      return Err(Errno::EINVAL(format!("{pathname}: cannot end in '{name}'")));
    }
    if self.lookup(&destination_inode, &name)?.is_some() {
      return Err(Errno::EEXIST(format!("{destination}/{name} already exists")));
    }
    if self.is_within(destination_index, source_index)? {
      return Err(Errno::EINVAL(format!("cannot copy {pathname} into itself")));
    }
    self.ensure_journal_room()?;

    let snapshot = self.snapshot(credentials, pathname)?;
    self.materialize(credentials, destination_index, &snapshot)?;
    self.record("copy", pathname, destination.as_bytes())
  }

  pub fn move_to(&mut self, credentials: &Credentials, pathname: &str, destination: &str) -> Result<(), Errno> {
    let (parent_index, mut parent, name) = self.resolve_parent(pathname)?;
    let index = self
      .lookup(&parent, &name)?
      .ok_or_else(|| Errno::ENOENT(format!("{pathname}: no such file or folder")))?;
    let mut inode = self.read_inode(index)?;
    perms::check(credentials, &inode, Access::Write, pathname)?;
    let (destination_index, mut destination_inode) = self.destination_folder(credentials, destination)?;
    if self.lookup(&destination_inode, &name)?.is_some() {
      return Err(Errno::EEXIST(format!("{destination}/{name} already exists")));
    }
    if inode.is_folder() && self.is_within(destination_index, index)? {
      return Err(Errno::EINVAL(format!("cannot move {pathname} into itself")));
    }
    self.ensure_journal_room()?;

    self.remove_entry(parent_index, &mut parent, &name)?;
    if let Err(errno) = self.add_entry(destination_index, &mut destination_inode, &name, index) {
      let mut parent = self.read_inode(parent_index)?;
      self.add_entry(parent_index, &mut parent, &name, index)?;
      return Err(errno);
    }
    if inode.is_folder() {
      self.write_entry(&inode, "..", FolderEntry::new("..", destination_index))?;
    }
    inode.touch(unixtime());
    self.write_inode(index, &inode)?;

    self.record("move", pathname, destination.as_bytes())
  }

  pub fn find(&mut self, credentials: &Credentials, pathname: &str, pattern: &str) -> Result<Vec<String>, Errno> {
    let regex = glob_to_regex(pattern)?;
    let (_, inode) = self.resolve(pathname)?;
    let base = normalize(pathname)?;
    let mut matches = Vec::new();
    self.find_below(credentials, &base, &inode, &regex, &mut matches)?;
    Ok(matches)
  }

  fn find_below(
    &mut self,
    credentials: &Credentials,
    base: &str,
    folder: &Inode,
    regex: &Regex,
    matches: &mut Vec<String>,
  ) -> Result<(), Errno> {
    if !folder.is_folder() || !perms::permits(credentials, folder, Access::Read) {
      return Ok(());
    }
    for (name, child) in self.children(folder)? {
      let child_path = if base == "/" { format!("/{name}") } else { format!("{base}/{name}") };
      if regex.is_match(&name).map_err(|error| Errno::EINVAL(error.to_string()))? {
        matches.push(child_path.clone());
      }
      let child_inode = self.read_inode(child)?;
      self.find_below(credentials, &child_path, &child_inode, regex, matches)?;
    }
    Ok(())
  }

  pub fn chmod(&mut self, credentials: &Credentials, pathname: &str, mode: FileMode, recursive: bool) -> Result<(), Errno> {
    self.change(credentials, pathname, recursive, |inode| inode.perm = mode.0)?;
    let content = if recursive { format!("{mode},r") } else { mode.to_string() };
    self.record("chmod", pathname, content.as_bytes())
  }

  pub fn chown(
    &mut self,
    credentials: &Credentials,
    pathname: &str,
    owner: (&str, i32, i32),
    recursive: bool,
  ) -> Result<(), Errno> {
    let (user, uid, gid) = owner;
    self.change(credentials, pathname, recursive, |inode| {
      inode.uid = uid;
      inode.gid = gid;
    })?;
    let content = if recursive { format!("{user},r") } else { user.to_owned() };
    self.record("chown", pathname, content.as_bytes())
  }

  /// Apply `update` to the target (which the caller must own) and, when
  /// recursive, to every descendant the caller owns.
  fn change<F: Fn(&mut Inode)>(
    &mut self,
    credentials: &Credentials,
    pathname: &str,
    recursive: bool,
    update: F,
  ) -> Result<(), Errno> {
    let (index, inode) = self.resolve(pathname)?;
    if !credentials.owns(&inode) {
      return Err(Errno::EPERM(format!("{pathname}: only the owner or root may change it")));
    }
    self.ensure_journal_room()?;

    let targets = if recursive { self.subtree(index)? } else { vec![(index, inode)] };
    let now = unixtime();
    for (node, mut node_inode) in targets {
      if node != index && !credentials.owns(&node_inode) {
        continue;
      }
      update(&mut node_inode);
      node_inode.ctime = now;
      self.write_inode(node, &node_inode)?;
    }
    Ok(())
  }

  /// Listing row. Owner and group fall back to their ids when users.txt
  /// has no name for them.
  pub fn file_node(name: &str, inode: &Inode, users: Option<&Users>) -> FileNode {
    let mode = FileMode(inode.perm);
    let owner = users.and_then(|users| users.user_name(inode.uid));
    let group = users.and_then(|users| users.group_name(inode.gid));
    FileNode {
      name: name.to_owned(),
      r#type: String::from(if inode.is_folder() { "folder" } else { "file" }),
      size: inode.size,
      perm: mode.to_string(),
      mode: format!("{}{}", if inode.is_folder() { 'd' } else { '-' }, mode.symbolic()),
      uid: inode.uid,
      gid: inode.gid,
      owner: owner.unwrap_or_else(|| inode.uid.to_string()),
      group: group.unwrap_or_else(|| inode.gid.to_string()),
      mtime: human_time(inode.mtime),
    }
  }

  pub fn list(&mut self, pathname: &str) -> Result<Vec<FileNode>, Errno> {
    let (_, inode) = self.resolve(pathname)?;
    let users = self.users().ok();
    if !inode.is_folder() {
      let (_, name) = split_path(pathname)?;
      return Ok(vec![Self::file_node(&name, &inode, users.as_ref())]);
    }
    let mut nodes = Vec::new();
    for (name, child) in self.children(&inode)? {
      let child_inode = self.read_inode(child)?;
      nodes.push(Self::file_node(&name, &child_inode, users.as_ref()));
    }
    Ok(nodes)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::path::PathBuf;

  use super::*;
  use crate::extfs::bitmap::Bitmap;
  use crate::extfs::format::mkfs_at;
  use crate::extfs::structs::NONE;
  use crate::util::mktemp;

  /// A fresh 128 KiB image formatted as ext2 or ext3.
  pub(crate) fn formatted(fs_type: i64) -> (ExtFilesystem, PathBuf) {
    let path = mktemp();
    let device = BlockDevice::create(&path, 128 * 1024).unwrap();
    let fs = mkfs_at(device, 0, 128 * 1024, fs_type).unwrap();
    (fs, path)
  }

  fn user(uid: i32, gid: i32) -> Credentials {
    Credentials { uid, gid }
  }

  #[test]
  fn mkdir_with_parents_and_read_back() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();

    fs.mkdir(&root, "/a/b/c", true).unwrap();
    fs.mkfile(&root, "/a/b/c/f.txt", false, b"01234567890123456789").unwrap();
    assert_eq!(fs.read_file(&root, "/a/b/c/f.txt").unwrap(), b"01234567890123456789");
    assert_eq!(fs.read_file(&root, "//a/./b/c/../c/f.txt").unwrap(), b"01234567890123456789");

    let (c_index, c) = fs.resolve("/a/b/c").unwrap();
    let (b_index, _) = fs.resolve("/a/b").unwrap();
    let entries = fs.entries(&c).unwrap();
    assert_eq!(entries[0], (String::from("."), c_index));
    assert_eq!(entries[1], (String::from(".."), b_index));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn mkdir_errors() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();

    assert!(matches!(fs.mkdir(&root, "/x/y", false), Err(Errno::ENOENT(_))));
    fs.mkdir(&root, "/x", false).unwrap();
    assert!(matches!(fs.mkdir(&root, "/x", false), Err(Errno::EEXIST(_))));
    assert!(matches!(fs.mkdir(&root, "/", false), Err(Errno::EEXIST(_))));
    assert!(matches!(fs.mkdir(&root, "/abcdefghijklm", false), Err(Errno::ENAMETOOLONG(_))));
    assert!(matches!(fs.mkdir(&root, "relative", false), Err(Errno::EINVAL(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn failed_parents_are_rolled_back() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    let free_inodes = fs.superblock.free_inodes_count;
    let free_blocks = fs.superblock.free_blocks_count;

    // "/r" and "/r/s" get created before the final name is rejected
    assert!(matches!(fs.mkdir(&root, "/r/s/abcdefghijklm", true), Err(Errno::ENAMETOOLONG(_))));
    assert_eq!(fs.superblock.free_inodes_count, free_inodes);
    assert_eq!(fs.superblock.free_blocks_count, free_blocks);
    assert!(matches!(fs.resolve("/r"), Err(Errno::ENOENT(_))));

    fs.mkfile(&root, "/plain", false, b"").unwrap();
    assert!(matches!(fs.mkdir(&root, "/plain/deep/x", true), Err(Errno::ENOTDIR(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn folders_grow_new_blocks() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/d", false).unwrap();
    for i in 0..9 {
      fs.mkfile(&root, &format!("/d/f{i}"), false, b"x").unwrap();
    }
    let (_, folder) = fs.resolve("/d").unwrap();
    assert_eq!(fs.folder_blocks(&folder).unwrap().len(), 3);
    assert_eq!(fs.children(&folder).unwrap().len(), 9);
    assert_eq!(fs.entries(&folder).unwrap().len(), 11);

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn remove_frees_everything() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    let free_inodes = fs.superblock.free_inodes_count;
    let free_blocks = fs.superblock.free_blocks_count;

    fs.mkdir(&root, "/t/u", true).unwrap();
    fs.mkfile(&root, "/t/u/big", false, &vec![b'z'; 20 * 64]).unwrap();
    fs.mkfile(&root, "/t/small", false, b"abc").unwrap();
    fs.remove(&root, "/t").unwrap();

    assert_eq!(fs.superblock.free_inodes_count, free_inodes);
    // the root folder keeps its block, nothing else stays allocated
    assert_eq!(fs.superblock.free_blocks_count, free_blocks);
    assert!(matches!(fs.resolve("/t"), Err(Errno::ENOENT(_))));
    assert!(matches!(fs.remove(&root, "/"), Err(Errno::EINVAL(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn remove_checks_every_descendant() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/shared", false).unwrap();
    fs.chmod(&root, "/shared", FileMode::parse("777").unwrap(), false).unwrap();
    let alice = user(2, 2);
    fs.mkdir(&alice, "/shared/mine", false).unwrap();
    fs.mkfile(&root, "/shared/mine/locked", false, b"x").unwrap();

    assert!(matches!(fs.remove(&alice, "/shared/mine"), Err(Errno::EACCES(_))));
    assert!(fs.resolve("/shared/mine/locked").is_ok());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn trailing_dot_components_are_refused() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/a/b", true).unwrap();
    fs.mkdir(&root, "/c", false).unwrap();
    let used = fs.used_inodes().unwrap().len();

    assert!(matches!(fs.remove(&root, "/a/.."), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.remove(&root, "/a/b/."), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.remove(&root, "/a/b/.."), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.rename(&root, "/a/.", "x"), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.move_to(&root, "/a/..", "/c"), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.copy(&root, "/a/b/..", "/c"), Err(Errno::EINVAL(_))));

    assert_eq!(fs.used_inodes().unwrap().len(), used);
    let (a_index, a) = fs.resolve("/a").unwrap();
    let entries = fs.entries(&a).unwrap();
    assert_eq!(entries[0], (String::from("."), a_index));
    assert_eq!(entries[1], (String::from(".."), ROOT_INODE));
    assert!(fs.resolve("/a/b").is_ok());
    let (_, c) = fs.resolve("/c").unwrap();
    assert!(fs.children(&c).unwrap().is_empty());
    assert!(fs.read_file(&root, "/users.txt").is_ok());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn rename_and_collisions() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkfile(&root, "/a", false, b"1").unwrap();
    fs.mkfile(&root, "/b", false, b"2").unwrap();

    assert!(matches!(fs.rename(&root, "/a", "b"), Err(Errno::EEXIST(_))));
    fs.rename(&root, "/a", "c").unwrap();
    assert_eq!(fs.read_file(&root, "/c").unwrap(), b"1");
    assert!(matches!(fs.resolve("/a"), Err(Errno::ENOENT(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn copy_is_deep() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/src/inner", true).unwrap();
    fs.mkfile(&root, "/src/inner/f", false, b"payload").unwrap();
    fs.mkdir(&root, "/dst", false).unwrap();

    fs.copy(&root, "/src", "/dst").unwrap();
    assert_eq!(fs.read_file(&root, "/dst/src/inner/f").unwrap(), b"payload");
    let (copy_index, _) = fs.resolve("/dst/src/inner/f").unwrap();
    let (original_index, _) = fs.resolve("/src/inner/f").unwrap();
    assert_ne!(copy_index, original_index);

    assert!(matches!(fs.copy(&root, "/src", "/dst"), Err(Errno::EEXIST(_))));
    assert!(matches!(fs.copy(&root, "/src", "/src/inner"), Err(Errno::EINVAL(_))));
    assert!(matches!(fs.copy(&root, "/src", "/src/inner/f"), Err(Errno::ENOTDIR(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn copy_between_handles() {
    let (mut source, source_path) = formatted(2);
    let (mut target, target_path) = formatted(3);
    let root = Credentials::root();
    source.mkdir(&root, "/docs", false).unwrap();
    source.mkfile(&root, "/docs/readme", false, b"hello").unwrap();

    let snapshot = source.snapshot(&root, "/docs").unwrap();
    target.materialize(&root, ROOT_INODE, &snapshot).unwrap();
    assert_eq!(target.read_file(&root, "/docs/readme").unwrap(), b"hello");

    drop(source);
    drop(target);
    std::fs::remove_file(source_path).unwrap();
    std::fs::remove_file(target_path).unwrap();
  }

  #[test]
  fn move_rewires_parent_links() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/a/child", true).unwrap();
    fs.mkfile(&root, "/a/child/f", false, b"data").unwrap();
    fs.mkdir(&root, "/b", false).unwrap();
    let free_blocks = fs.superblock.free_blocks_count;

    fs.move_to(&root, "/a/child", "/b").unwrap();
    assert_eq!(fs.read_file(&root, "/b/child/f").unwrap(), b"data");
    assert!(matches!(fs.resolve("/a/child"), Err(Errno::ENOENT(_))));
    assert_eq!(fs.superblock.free_blocks_count, free_blocks);

    let (child_index, child) = fs.resolve("/b/child").unwrap();
    let (b_index, _) = fs.resolve("/b").unwrap();
    assert_eq!(fs.lookup(&child, "..").unwrap(), Some(b_index));
    assert_eq!(fs.lookup(&child, ".").unwrap(), Some(child_index));

    assert!(matches!(fs.move_to(&root, "/b", "/b/child"), Err(Errno::EINVAL(_))));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn find_uses_globs_in_preorder() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/p/q", true).unwrap();
    fs.mkfile(&root, "/p/a.txt", false, b"").unwrap();
    fs.mkfile(&root, "/p/q/b.txt", false, b"").unwrap();
    fs.mkfile(&root, "/p/q/c.md", false, b"").unwrap();

    assert_eq!(fs.find(&root, "/", "*.txt").unwrap(), vec!["/users.txt", "/p/q/b.txt", "/p/a.txt"]);
    assert_eq!(fs.find(&root, "/p", "?.md").unwrap(), vec!["/p/q/c.md"]);
    assert_eq!(fs.find(&root, "/p", "a.t?t").unwrap(), vec!["/p/a.txt"]);
    assert!(fs.find(&root, "/p", "a.tx").unwrap().is_empty());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn chmod_and_chown_need_ownership() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkdir(&root, "/pub", false).unwrap();
    fs.chmod(&root, "/pub", FileMode::parse("777").unwrap(), false).unwrap();
    let alice = user(2, 2);
    let bob = user(3, 3);
    fs.mkfile(&alice, "/pub/note", false, b"hi").unwrap();

    assert!(matches!(
      fs.chmod(&bob, "/pub/note", FileMode::parse("777").unwrap(), false),
      Err(Errno::EPERM(_))
    ));
    fs.chmod(&alice, "/pub/note", FileMode::parse("600").unwrap(), false).unwrap();
    assert!(matches!(fs.read_file(&bob, "/pub/note"), Err(Errno::EACCES(_))));

    fs.chown(&root, "/pub", ("bob", 3, 3), true).unwrap();
    let (_, note) = fs.resolve("/pub/note").unwrap();
    assert_eq!((note.uid, note.gid), (3, 3));
    assert_eq!(fs.read_file(&bob, "/pub/note").unwrap(), b"hi");

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn edit_replaces_content() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkfile(&root, "/e", false, &vec![b'a'; 300]).unwrap();
    let free_blocks = fs.superblock.free_blocks_count;

    fs.edit(&root, "/e", b"short").unwrap();
    assert_eq!(fs.read_file(&root, "/e").unwrap(), b"short");
    assert_eq!(fs.superblock.free_blocks_count, free_blocks + 4);

    let (_, inode) = fs.resolve("/e").unwrap();
    assert!(inode.block[1..].iter().all(|&pointer| pointer == NONE));
    assert!(fs.is_used(Bitmap::Blocks, inode.block[0]).unwrap());

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn list_reports_nodes() {
    let (mut fs, path) = formatted(2);
    let root = Credentials::root();
    fs.mkfile(&root, "/n", false, b"1234").unwrap();

    let nodes = fs.list("/").unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name, "users.txt");
    assert_eq!(nodes[1].name, "n");
    assert_eq!(nodes[1].size, 4);
    assert_eq!(nodes[1].mode, "-rw-rw-r--");
    assert_eq!((nodes[1].owner.as_str(), nodes[1].group.as_str()), ("root", "root"));

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }
}

#[cfg(test)]
mod fs_split_path_tests {
  use super::*;

  #[test]
  fn split_path_root() {
    assert_eq!(split_path("/").unwrap(), (Vec::new(), String::from("/")));
  }
  #[test]
  fn split_path_only_slashes() {
    assert_eq!(split_path("//////").unwrap(), (Vec::new(), String::from("/")));
    assert_eq!(split_path("//").unwrap(), (Vec::new(), String::from("/")));
  }
  #[test]
  fn split_path_valid_1() {
    assert_eq!(split_path("/test1").unwrap(), (Vec::new(), String::from("test1")));
  }
  #[test]
  fn split_path_valid_3() {
    assert_eq!(
      split_path("/test1/test2/test3").unwrap(),
      (vec![String::from("test1"), String::from("test2")], String::from("test3"))
    );
  }
  #[test]
  fn split_path_valid_multiple_slashes() {
    assert_eq!(
      split_path("//test1//test2///test3////").unwrap(),
      (vec![String::from("test1"), String::from("test2")], String::from("test3"))
    );
  }
  #[test]
  fn split_path_zero_length() {
    assert!(matches!(split_path(""), Err(Errno::EINVAL(_))));
  }
  #[test]
  fn split_path_relative() {
    assert!(matches!(split_path("test1/test2"), Err(Errno::EINVAL(_))));
  }
  #[test]
  fn components_and_normalize() {
    assert!(components("/").unwrap().is_empty());
    assert_eq!(components("/a//b/").unwrap(), vec!["a", "b"]);
    assert_eq!(normalize("//a//b/").unwrap(), "/a/b");
  }
  #[test]
  fn names() {
    assert!(validate_name("abcdefghijkl").is_ok());
    assert!(matches!(validate_name("abcdefghijklm"), Err(Errno::ENAMETOOLONG(_))));
    assert!(validate_name("..").is_err());
  }
}

// vim:ts=2 sw=2
