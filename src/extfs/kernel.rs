use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use super::device::BlockDevice;
use super::disk::{self, Located};
use super::format::{self, parse_fs_type};
use super::fs::{ExtFilesystem, FileNode};
use super::inode::MAX_FILE_SIZE;
use super::journal::JournalRegions;
use super::mount::{MountRegistry, MountedPartition};
use super::partition::{self, DeleteMode};
use super::perms::{Credentials, FileMode};
use super::report::{self, DiskInfo, Report, ReportKind};
use super::structs::{verify_layout, Fit, JournalEntry, Mbr};
use super::users::Account;
use crate::machine::{DiskRegistry, MachineConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Errno {
  /// Invalid argument
  EINVAL(String),
  /// No such entity
  ENOENT(String),
  /// Already exists
  EEXIST(String),
  /// No space left
  ENOSPC(String),
  /// Permission denied
  EACCES(String),
  /// Operation not permitted
  EPERM(String),
  /// Resource busy
  EBUSY(String),
  /// Structure needs cleaning
  EUCLEAN(String),
  /// Journal capacity reached
  EJOURNALFULL(String),
  /// Not a directory
  ENOTDIR(String),
  /// Is a directory
  EISDIR(String),
  /// Name too long
  ENAMETOOLONG(String),
  /// I/O Error
  EIO(String),
}

/// Coarse classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Arg,
  NotFound,
  AlreadyExists,
  NoSpace,
  Permission,
  Corruption,
  JournalFull,
  Io,
}

impl Errno {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Errno::EINVAL(_) | Errno::ENOTDIR(_) | Errno::EISDIR(_) | Errno::ENAMETOOLONG(_) => ErrorKind::Arg,
      Errno::ENOENT(_) => ErrorKind::NotFound,
      Errno::EEXIST(_) => ErrorKind::AlreadyExists,
      Errno::ENOSPC(_) => ErrorKind::NoSpace,
      Errno::EACCES(_) | Errno::EPERM(_) | Errno::EBUSY(_) => ErrorKind::Permission,
      Errno::EUCLEAN(_) => ErrorKind::Corruption,
      Errno::EJOURNALFULL(_) => ErrorKind::JournalFull,
      Errno::EIO(_) => ErrorKind::Io,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Errno::EINVAL(_) => "EINVAL",
      Errno::ENOENT(_) => "ENOENT",
      Errno::EEXIST(_) => "EEXIST",
      Errno::ENOSPC(_) => "ENOSPC",
      Errno::EACCES(_) => "EACCES",
      Errno::EPERM(_) => "EPERM",
      Errno::EBUSY(_) => "EBUSY",
      Errno::EUCLEAN(_) => "EUCLEAN",
      Errno::EJOURNALFULL(_) => "EJOURNALFULL",
      Errno::ENOTDIR(_) => "ENOTDIR",
      Errno::EISDIR(_) => "EISDIR",
      Errno::ENAMETOOLONG(_) => "ENAMETOOLONG",
      Errno::EIO(_) => "EIO",
    }
  }

  pub fn message(&self) -> &str {
    match self {
      Errno::EINVAL(message)
      | Errno::ENOENT(message)
      | Errno::EEXIST(message)
      | Errno::ENOSPC(message)
      | Errno::EACCES(message)
      | Errno::EPERM(message)
      | Errno::EBUSY(message)
      | Errno::EUCLEAN(message)
      | Errno::EJOURNALFULL(message)
      | Errno::ENOTDIR(message)
      | Errno::EISDIR(message)
      | Errno::ENAMETOOLONG(message)
      | Errno::EIO(message) => message,
    }
  }

  /// Prefix the message with `context`, keeping the variant.
  pub fn context(self, context: &str) -> Self {
    let wrap = |message: String| format!("{context}: {message}");
    match self {
      Errno::EINVAL(message) => Errno::EINVAL(wrap(message)),
      Errno::ENOENT(message) => Errno::ENOENT(wrap(message)),
      Errno::EEXIST(message) => Errno::EEXIST(wrap(message)),
      Errno::ENOSPC(message) => Errno::ENOSPC(wrap(message)),
      Errno::EACCES(message) => Errno::EACCES(wrap(message)),
      Errno::EPERM(message) => Errno::EPERM(wrap(message)),
      Errno::EBUSY(message) => Errno::EBUSY(wrap(message)),
      Errno::EUCLEAN(message) => Errno::EUCLEAN(wrap(message)),
      Errno::EJOURNALFULL(message) => Errno::EJOURNALFULL(wrap(message)),
      Errno::ENOTDIR(message) => Errno::ENOTDIR(wrap(message)),
      Errno::EISDIR(message) => Errno::EISDIR(wrap(message)),
      Errno::ENAMETOOLONG(message) => Errno::ENAMETOOLONG(wrap(message)),
      Errno::EIO(message) => Errno::EIO(wrap(message)),
    }
  }
}

impl fmt::Display for Errno {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name(), self.message())
  }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
  fn from(error: std::io::Error) -> Self {
    match error.kind() {
      std::io::ErrorKind::NotFound => Errno::ENOENT(error.to_string()),
      std::io::ErrorKind::PermissionDenied => Errno::EACCES(error.to_string()),
      std::io::ErrorKind::UnexpectedEof => Errno::EUCLEAN(error.to_string()),
      _ => Errno::EIO(error.to_string()),
    }
  }
}

/// Logged-in user and the partition they work on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
  pub user: String,
  pub group: String,
  pub uid: i32,
  pub gid: i32,
  pub partition_id: String,
}

impl Session {
  fn new(account: Account, partition_id: &str) -> Self {
    Self {
      user: account.name,
      group: account.group,
      uid: account.uid,
      gid: account.gid,
      partition_id: partition_id.to_owned(),
    }
  }

  pub fn credentials(&self) -> Credentials {
    Credentials { uid: self.uid, gid: self.gid }
  }
}

/// Where `mkfile` takes its content from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
  Empty,
  /// `size` bytes of `0123456789` repeated.
  Size(i64),
  /// A file on the host.
  Host(PathBuf),
}

fn fits_in_a_file(size: u64) -> Result<usize, Errno> {
  match usize::try_from(size) {
    Ok(size) if size <= MAX_FILE_SIZE => Ok(size),
    _ => Err(Errno::ENOSPC(format!("{size} bytes exceed the largest file ({MAX_FILE_SIZE} bytes)"))),
  }
}

impl FileSource {
  pub fn content(&self) -> Result<Vec<u8>, Errno> {
    match self {
      FileSource::Empty => Ok(Vec::new()),
      FileSource::Size(size) if *size < 0 => Err(Errno::EINVAL(format!("size must not be negative, got {size}"))),
      FileSource::Size(size) => {
        let size = fits_in_a_file(*size as u64)?;
        Ok(b"0123456789".iter().copied().cycle().take(size).collect())
      }
      FileSource::Host(path) => {
        let context = |error: std::io::Error| Errno::from(error).context(&path.display().to_string());
        fits_in_a_file(std::fs::metadata(path).map_err(context)?.len())?;
        std::fs::read(path).map_err(context)
      }
    }
  }
}

/// Process-wide state: mounts, the session and the disks this machine made.
#[derive(Debug)]
pub struct Kernel {
  config: MachineConfig,
  mounts: MountRegistry,
  session: Option<Session>,
  allow_without_session: bool,
  disks: DiskRegistry,
}

impl Kernel {
  pub fn new(config: MachineConfig) -> Result<Self, Errno> {
    verify_layout()?;
    config.validate()?;
    let disks = DiskRegistry::load(config.registry.as_deref())?;
    debug!("kernel: {} registered disk(s)", disks.disks().len());

    Ok(Self {
      mounts: MountRegistry::new(&config.carnet_suffix),
      session: None,
      allow_without_session: config.allow_commands_without_session,
      disks,
      config,
    })
  }

  pub fn config(&self) -> &MachineConfig {
    &self.config
  }

  pub fn mounts(&self) -> &MountRegistry {
    &self.mounts
  }

  fn mounted(&self, id: &str) -> Result<MountedPartition, Errno> {
    self
      .mounts
      .get(id)
      .cloned()
      .ok_or_else(|| Errno::ENOENT(format!("no partition mounted as '{id}'")))
  }

  fn open(&self, id: &str) -> Result<ExtFilesystem, Errno> {
    let mounted = self.mounted(id)?;
    ExtFilesystem::open(&mounted).map_err(|errno| errno.context(&mounted.id))
  }

  /// Partition and caller the session commands run against.
  fn context(&self) -> Result<(MountedPartition, Credentials), Errno> {
    match &self.session {
      Some(session) => Ok((self.mounted(&session.partition_id)?, session.credentials())),
      None if self.allow_without_session => {
        let mounted = self
          .mounts
          .first()
          .cloned()
          .ok_or_else(|| Errno::ENOENT(String::from("no partition is mounted")))?;
        Ok((mounted, Credentials::root()))
      }
      None => Err(Errno::EPERM(String::from("no active session, login first"))),
    }
  }

  fn with_session<T, F>(&self, f: F) -> Result<T, Errno>
  where
    F: FnOnce(&mut ExtFilesystem, &Credentials) -> Result<T, Errno>,
  {
    let (mounted, credentials) = self.context()?;
    let mut fs = ExtFilesystem::open(&mounted).map_err(|errno| errno.context(&mounted.id))?;
    f(&mut fs, &credentials)
  }
}

/// Disks and partitions
impl Kernel {
  pub fn mkdisk(&mut self, path: &Path, size: i64, fit: Fit) -> Result<Mbr, Errno> {
    let mbr = disk::mkdisk(path, size, fit)?;
    self.disks.add(path)?;
    Ok(mbr)
  }

  pub fn rmdisk(&mut self, path: &Path) -> Result<(), Errno> {
    if let Some(mounted) = self.mounts.list().iter().find(|mounted| same_file(&mounted.path, path)) {
      return Err(Errno::EBUSY(format!("{}: partition {} is mounted", path.display(), mounted.id)));
    }
    disk::rmdisk(path)?;
    self.disks.remove(path)
  }

  pub fn fdisk_create(&mut self, path: &Path, name: &str, size: i64, r#type: u8, fit: Fit) -> Result<Located, Errno> {
    partition::create(path, name, size, r#type, fit)
  }

  pub fn fdisk_delete(&mut self, path: &Path, name: &str, mode: DeleteMode) -> Result<Located, Errno> {
    let mut device = BlockDevice::open(path, false)?;
    let mbr = disk::read_mbr(&mut device)?;
    let located = disk::find_partition(&mut device, &mbr, name)?;
    drop(device);

    let busy = self.mounts.within(path, located.start, located.end());
    if let Some(mounted) = busy.first() {
      return Err(Errno::EBUSY(format!("partition '{name}' is in use by mount {}", mounted.id)));
    }
    partition::delete(path, name, mode)
  }

  pub fn fdisk_add(&mut self, path: &Path, name: &str, delta: i64) -> Result<i64, Errno> {
    let mounted = self.mounts.find(path, name).cloned();
    let min_size = match &mounted {
      Some(mounted) if mounted.fs_type != 0 => Some(ExtFilesystem::open(mounted)?.footprint()),
      _ => None,
    };
    let size = partition::add(path, name, delta, min_size)?;
    if let Some(mounted) = mounted.and_then(|mounted| self.mounts.get_mut(&mounted.id)) {
      mounted.size = size;
    }
    Ok(size)
  }

  pub fn mount(&mut self, path: &Path, name: &str) -> Result<MountedPartition, Errno> {
    self.mounts.mount(path, name)
  }

  pub fn unmount(&mut self, id: &str) -> Result<MountedPartition, Errno> {
    let result = self.mounts.unmount(id);
    let orphaned = match &self.session {
      Some(session) => self.mounts.get(&session.partition_id).is_none(),
      None => false,
    };
    if orphaned {
      warn!("unmount: session on {id} ended");
      self.session = None;
    }
    result
  }

  pub fn mkfs(&mut self, id: &str, fs: &str) -> Result<(), Errno> {
    let fs_type = parse_fs_type(fs)?;
    let mounted = self.mounted(id)?;
    format::mkfs(&mounted, fs_type)?;
    if let Some(mounted) = self.mounts.get_mut(id) {
      mounted.fs_type = fs_type;
    }
    Ok(())
  }
}

/// Sessions
impl Kernel {
  pub fn login(&mut self, user: &str, password: &str, id: &str) -> Result<&Session, Errno> {
    if let Some(session) = &self.session {
      return Err(Errno::EPERM(format!("'{}' is already logged in, logout first", session.user)));
    }
    let mounted = self.mounted(id)?;
    let account = self.open(id)?.users()?.authenticate(user, password)?;
    info!("login: {user} on {}", mounted.id);
    Ok(self.session.insert(Session::new(account, &mounted.id)))
  }

  pub fn logout(&mut self) -> Result<Session, Errno> {
    let session = self
      .session
      .take()
      .ok_or_else(|| Errno::EPERM(String::from("no active session")))?;
    info!("logout: {}", session.user);
    Ok(session)
  }

  pub fn set_allow_commands_without_session(&mut self, allow: bool) {
    self.allow_without_session = allow;
  }

  pub fn get_session(&self) -> Option<&Session> {
    self.session.as_ref()
  }
}

/// Users and groups
impl Kernel {
  pub fn mkgrp(&mut self, name: &str) -> Result<i32, Errno> {
    self.with_session(|fs, credentials| fs.mkgrp(credentials, name))
  }

  pub fn rmgrp(&mut self, name: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.rmgrp(credentials, name))
  }

  pub fn mkusr(&mut self, user: &str, password: &str, group: &str) -> Result<i32, Errno> {
    self.with_session(|fs, credentials| fs.mkusr(credentials, user, password, group))
  }

  pub fn rmusr(&mut self, user: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.rmusr(credentials, user))
  }

  pub fn chgrp(&mut self, user: &str, group: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.chgrp(credentials, user, group))
  }
}

/// Files and folders of the session partition
impl Kernel {
  pub fn mkdir(&mut self, path: &str, parents: bool) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.mkdir(credentials, path, parents))
  }

  pub fn mkfile(&mut self, path: &str, parents: bool, source: &FileSource) -> Result<(), Errno> {
    let content = source.content()?;
    self.with_session(|fs, credentials| fs.mkfile(credentials, path, parents, &content))
  }

  /// Contents of every file, joined by newlines.
  pub fn cat(&mut self, paths: &[String]) -> Result<String, Errno> {
    if paths.is_empty() {
      return Err(Errno::EINVAL(String::from("cat needs at least one file")));
    }
    self.with_session(|fs, credentials| {
      let mut contents = Vec::with_capacity(paths.len());
      for path in paths {
        let content = fs.read_file(credentials, path)?;
        contents.push(String::from_utf8_lossy(&content).into_owned());
      }
      Ok(contents.join("\n"))
    })
  }

  pub fn remove(&mut self, path: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.remove(credentials, path))
  }

  pub fn edit(&mut self, path: &str, host: &Path) -> Result<(), Errno> {
    let content = FileSource::Host(host.to_owned()).content()?;
    self.with_session(|fs, credentials| fs.edit(credentials, path, &content))
  }

  pub fn rename(&mut self, path: &str, name: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.rename(credentials, path, name))
  }

  pub fn copy(&mut self, path: &str, destination: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.copy(credentials, path, destination))
  }

  pub fn move_to(&mut self, path: &str, destination: &str) -> Result<(), Errno> {
    self.with_session(|fs, credentials| fs.move_to(credentials, path, destination))
  }

  pub fn find(&mut self, path: &str, pattern: &str) -> Result<Vec<String>, Errno> {
    self.with_session(|fs, credentials| fs.find(credentials, path, pattern))
  }

  pub fn chown(&mut self, path: &str, user: &str, recursive: bool) -> Result<(), Errno> {
    self.with_session(|fs, credentials| {
      let account = fs
        .users()?
        .account(user)
        .ok_or_else(|| Errno::ENOENT(format!("user '{user}' does not exist")))?;
      fs.chown(credentials, path, (user, account.uid, account.gid), recursive)
    })
  }

  pub fn chmod(&mut self, path: &str, ugo: &str, recursive: bool) -> Result<(), Errno> {
    let mode = FileMode::parse(ugo)?;
    self.with_session(|fs, credentials| fs.chmod(credentials, path, mode, recursive))
  }
}

/// Journal
impl Kernel {
  pub fn loss(&mut self, id: &str) -> Result<(), Errno> {
    self.open(id)?.loss()
  }

  pub fn recovery(&mut self, id: &str) -> Result<usize, Errno> {
    self.open(id)?.recover()
  }

  pub fn get_journal(&self, id: &str) -> Result<Vec<JournalEntry>, Errno> {
    let mut fs = self.open(id)?;
    if fs.fs_type() != 3 {
      return Err(Errno::EINVAL(format!("{id}: journaling needs an ext3 partition")));
    }
    fs.journal()
  }

  pub fn repair_journal(&mut self, id: &str) -> Result<usize, Errno> {
    self.open(id)?.repair_journal()
  }

  pub fn dump_journal_regions(&self, id: &str) -> Result<JournalRegions, Errno> {
    self.open(id)?.journal_regions()
  }
}

/// Reports and the programmatic surface
impl Kernel {
  /// Build a report and write it to `output`. Disk reports take `disk` or
  /// the disk behind `id`; the rest need `id`.
  pub fn report(
    &mut self,
    kind: ReportKind,
    output: &Path,
    id: Option<&str>,
    disk: Option<&Path>,
    path_file_ls: Option<&str>,
  ) -> Result<Report, Errno> {
    let report = if kind.is_disk_level() {
      let path = match (disk, id) {
        (Some(disk), _) => disk.to_owned(),
        (None, Some(id)) => self.mounted(id)?.path,
        (None, None) => return Err(Errno::EINVAL(String::from("rep needs -id or -disk"))),
      };
      match kind {
        ReportKind::Mbr => report::mbr_report(&path, &self.mounts)?,
        _ => report::disk_report(&path)?,
      }
    } else {
      let id = id.ok_or_else(|| Errno::EINVAL(String::from("rep needs -id")))?;
      self.open(id)?.report(kind, path_file_ls)?
    };
    report.write(output)?;
    Ok(report)
  }

  /// Registered disks plus any disk with a mounted partition.
  pub fn get_all_disks(&self) -> Result<Vec<DiskInfo>, Errno> {
    let mut paths: BTreeSet<PathBuf> = self.disks.disks().into_iter().collect();
    paths.extend(self.mounts.list().iter().map(|mounted| mounted.path.clone()));
    paths.iter().map(|path| report::disk_info(path, &self.mounts)).collect()
  }

  pub fn get_mounted_partitions(&self) -> &[MountedPartition] {
    self.mounts.list()
  }

  pub fn get_mounted_partition(&self, id: &str) -> Option<&MountedPartition> {
    self.mounts.get(id)
  }

  pub fn get_files_list(&self, id: &str, path: &str) -> Result<Vec<FileNode>, Errno> {
    self.open(id)?.list(path)
  }

  /// Read as the session user, or as root when nobody is logged in.
  pub fn read_file_by_path(&self, id: &str, path: &str) -> Result<Vec<u8>, Errno> {
    let credentials = self.session.as_ref().map_or_else(Credentials::root, Session::credentials);
    self.open(id)?.read_file(&credentials, path)
  }
}

fn same_file(a: &Path, b: &Path) -> bool {
  match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
    (Ok(a), Ok(b)) => a == b,
    _ => a == b,
  }
}


// vim:ts=2 sw=2
