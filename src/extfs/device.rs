use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use super::codec::Record;
use super::kernel::Errno;

/// Chunk used when zero-filling ranges.
const ZERO_CHUNK: usize = 64 * 1024;

/// A host file accessed as a raw disk. The handle is closed on drop.
#[derive(Debug)]
pub struct BlockDevice {
  file: File,
  path: PathBuf,
  size: i64,
}

impl BlockDevice {
  pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self, Errno> {
    let path = path.as_ref();
    let file = OpenOptions::new()
      .read(true)
      .write(writable)
      .open(path)
      .map_err(|error| Errno::from(error).context(&path.display().to_string()))?;
    let size = file.metadata()?.len() as i64;
    debug!("device: opened {} ({size} bytes, writable: {writable})", path.display());

    Ok(Self { file, path: path.to_owned(), size })
  }

  /// Create (or truncate) a zero-filled file of `size` bytes.
  pub fn create(path: impl AsRef<Path>, size: i64) -> Result<Self, Errno> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(path)?;
    file.set_len(size as u64)?;
    debug!("device: created {} ({size} bytes)", path.display());

    Ok(Self { file, path: path.to_owned(), size })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn size(&self) -> i64 {
    self.size
  }

  fn check_range(&self, offset: i64, len: usize) -> Result<(), Errno> {
    if offset < 0 || offset + len as i64 > self.size {
      return Err(Errno::EIO(format!(
        "{}: range {offset}..{} outside device of {} bytes",
        self.path.display(),
        offset + len as i64,
        self.size
      )));
    }
    Ok(())
  }

  pub fn read_at(&mut self, offset: i64, len: usize) -> Result<Vec<u8>, Errno> {
    self.check_range(offset, len)?;
    trace!("device: read {len} bytes at {offset}");
    let mut bytes = vec![0u8; len];
    self.file.seek(SeekFrom::Start(offset as u64))?;
    self.file.read_exact(&mut bytes)?;
    Ok(bytes)
  }

  pub fn write_at(&mut self, offset: i64, bytes: &[u8]) -> Result<(), Errno> {
    self.check_range(offset, bytes.len())?;
    trace!("device: write {} bytes at {offset}", bytes.len());
    self.file.seek(SeekFrom::Start(offset as u64))?;
    self.file.write_all(bytes)?;
    Ok(())
  }

  pub fn truncate(&mut self, size: i64) -> Result<(), Errno> {
    if size < 0 {
      return Err(Errno::EINVAL(format!("truncate: negative size {size}")));
    }
    self.file.set_len(size as u64)?;
    self.size = size;
    Ok(())
  }

  pub fn zero_range(&mut self, offset: i64, len: i64) -> Result<(), Errno> {
    self.check_range(offset, len.max(0) as usize)?;
    let zeros = vec![0u8; ZERO_CHUNK];
    let mut position = offset;
    let end = offset + len;
    self.file.seek(SeekFrom::Start(offset as u64))?;
    while position < end {
      let chunk = ((end - position) as usize).min(ZERO_CHUNK);
      self.file.write_all(&zeros[..chunk])?;
      position += chunk as i64;
    }
    Ok(())
  }

  pub fn read_record<T: Record>(&mut self, offset: i64) -> Result<T, Errno> {
    let bytes = self.read_at(offset, T::SIZE)?;
    T::decode(&bytes)
  }

  pub fn write_record<T: Record>(&mut self, offset: i64, record: &T) -> Result<(), Errno> {
    self.write_at(offset, &record.encode())
  }

  pub fn flush(&mut self) -> Result<(), Errno> {
    self.file.flush()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extfs::structs::Inode;
  use crate::util::mktemp;

  #[test]
  fn create_read_write() {
    let path = mktemp();
    let mut device = BlockDevice::create(&path, 4096).unwrap();
    assert_eq!(device.size(), 4096);

    device.write_at(100, b"hello").unwrap();
    assert_eq!(device.read_at(100, 5).unwrap(), b"hello");
    assert_eq!(device.read_at(0, 4).unwrap(), vec![0; 4]);

    drop(device);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn out_of_range_is_rejected() {
    let path = mktemp();
    let mut device = BlockDevice::create(&path, 16).unwrap();

    assert!(matches!(device.read_at(10, 10), Err(Errno::EIO(_))));
    assert!(matches!(device.write_at(-1, b"x"), Err(Errno::EIO(_))));

    drop(device);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn zero_range_clears_bytes() {
    let path = mktemp();
    let mut device = BlockDevice::create(&path, 256).unwrap();
    device.write_at(0, &[0xff; 256]).unwrap();
    device.zero_range(10, 20).unwrap();

    let bytes = device.read_at(0, 256).unwrap();
    assert!(bytes[10..30].iter().all(|&byte| byte == 0));
    assert_eq!(bytes[9], 0xff);
    assert_eq!(bytes[30], 0xff);

    drop(device);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn records_at_offsets() {
    let path = mktemp();
    let mut device = BlockDevice::create(&path, 1024).unwrap();
    let inode = Inode::new(b'0', 2, 3, *b"640", 10);
    device.write_record(300, &inode).unwrap();
    assert_eq!(device.read_record::<Inode>(300).unwrap(), inode);

    drop(device);
    std::fs::remove_file(path).unwrap();
  }

  #[test]
  fn open_missing_is_enoent() {
    assert!(matches!(BlockDevice::open(mktemp(), false), Err(Errno::ENOENT(_))));
  }
}

// vim:ts=2 sw=2
