use fancy_regex::Regex;

use super::kernel::Errno;
use super::structs::Inode;
use crate::util::get_bit_at;

pub const ROOT_UID: i32 = 1;
pub const ROOT_GID: i32 = 1;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
  pub uid: i32,
  pub gid: i32,
}

impl Credentials {
  pub fn root() -> Self {
    Self { uid: ROOT_UID, gid: ROOT_GID }
  }

  pub fn is_root(&self) -> bool {
    self.uid == ROOT_UID
  }

  pub fn owns(&self, inode: &Inode) -> bool {
    self.is_root() || self.uid == inode.uid
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
  Read = 4,
  Write = 2,
  Execute = 1,
}

/// UGO triplet, stored on disk as three ASCII octal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub [u8; 3]);

impl FileMode {
  pub fn parse(ugo: &str) -> Result<Self, Errno> {
    let valid = Regex::new("^[0-7]{3}$")
      .map_err(|error| Errno::EINVAL(error.to_string()))?
      .is_match(ugo)
      .map_err(|error| Errno::EINVAL(error.to_string()))?;
    if !valid {
      return Err(Errno::EINVAL(format!("invalid ugo '{ugo}': expected three octal digits")));
    }
    let bytes = ugo.as_bytes();
    Ok(Self([bytes[0], bytes[1], bytes[2]]))
  }

  fn digit(&self, index: usize) -> u8 {
    self.0[index].wrapping_sub(b'0') & 0b111
  }

  pub fn user(&self) -> u8 {
    self.digit(0)
  }

  pub fn group(&self) -> u8 {
    self.digit(1)
  }

  pub fn others(&self) -> u8 {
    self.digit(2)
  }

  /// `rwxr-x---` rendering.
  pub fn symbolic(&self) -> String {
    [self.user(), self.group(), self.others()]
      .iter()
      .flat_map(|&triplet| {
        [(2, 'r'), (1, 'w'), (0, 'x')]
          .into_iter()
          .map(move |(bit, flag)| if get_bit_at(triplet, bit) { flag } else { '-' })
      })
      .collect()
  }
}

impl std::fmt::Display for FileMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", String::from_utf8_lossy(&self.0))
  }
}

pub fn permits(credentials: &Credentials, inode: &Inode, access: Access) -> bool {
  if credentials.is_root() {
    return true;
  }
  let mode = FileMode(inode.perm);
  let triplet = if credentials.uid == inode.uid {
    mode.user()
  } else if credentials.gid == inode.gid {
    mode.group()
  } else {
    mode.others()
  };
  triplet & access as u8 != 0
}

pub fn check(credentials: &Credentials, inode: &Inode, access: Access, path: &str) -> Result<(), Errno> {
  if permits(credentials, inode, access) {
    Ok(())
  } else {
    Err(Errno::EACCES(format!("{path}: permission denied ({access:?})")))
  }
}


// vim:ts=2 sw=2
