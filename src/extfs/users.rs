use std::fmt;

use fancy_regex::Regex;
use itertools::Itertools;
use log::info;
use serde::Serialize;

use super::fs::ExtFilesystem;
use super::kernel::Errno;
use super::perms::Credentials;

pub const USERS_FILE: &str = "users.txt";
pub const USERS_PATH: &str = "/users.txt";
pub const USERS_DEFAULT: &str = "1,G,root\n1,U,root,root,123\n";
/// Longest user name, group name or password.
pub const FIELD_MAX: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One line of users.txt. An id of `0` marks a deleted record.
pub enum Record {
  /// Serialized format: `gid,G,name`
  Group { gid: i32, name: String },
  /// Serialized format: `uid,U,group,name,password`
  User { uid: i32, group: String, name: String, password: String },
}

impl Record {
  pub fn id(&self) -> i32 {
    match self {
      Record::Group { gid, .. } => *gid,
      Record::User { uid, .. } => *uid,
    }
  }

  pub fn is_deleted(&self) -> bool {
    self.id() == 0
  }

  fn delete(&mut self) {
    match self {
      Record::Group { gid, .. } => *gid = 0,
      Record::User { uid, .. } => *uid = 0,
    }
  }
}

impl fmt::Display for Record {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Record::Group { gid, name } => write!(f, "{gid},G,{name}"),
      Record::User { uid, group, name, password } => write!(f, "{uid},U,{group},{name},{password}"),
    }
  }
}

/// A resolved, active user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
  pub uid: i32,
  pub gid: i32,
  pub name: String,
  pub group: String,
}

impl Account {
  pub fn credentials(&self) -> Credentials {
    Credentials { uid: self.uid, gid: self.gid }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Users {
  records: Vec<Record>,
}

fn line_matches(pattern: &str, line: &str) -> Result<bool, Errno> {
  Regex::new(pattern)
    .and_then(|regex| regex.is_match(line))
    .map_err(|error| Errno::EINVAL(format!("users.txt: {error}")))
}

fn validate_field(what: &str, value: &str) -> Result<(), Errno> {
  if value.is_empty() || value.contains(',') || value.contains('\n') {
    return Err(Errno::EINVAL(format!("invalid {what} '{value}'")));
  }
  if value.len() > FIELD_MAX {
    return Err(Errno::EINVAL(format!("{what} '{value}' exceeds {FIELD_MAX} characters")));
  }
  Ok(())
}

impl Users {
  /// Parse users.txt. Blank lines are skipped; anything else that is not a
  /// group or user line is corruption.
  pub fn parse(content: &str) -> Result<Self, Errno> {
    let mut records = Vec::new();
    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
      let fields: Vec<&str> = line.split(',').map(str::trim).collect();
      let id = fields[0]
        .parse::<i32>()
        .map_err(|_| Errno::EUCLEAN(format!("users.txt: bad id in '{line}'")))?;

      if line_matches(r"^\d+\s*,\s*G\s*,[^,]+$", line)? {
        records.push(Record::Group { gid: id, name: fields[2].to_owned() });
      } else if line_matches(r"^\d+\s*,\s*U\s*,[^,]+,[^,]+,[^,]*$", line)? {
        records.push(Record::User {
          uid: id,
          group: fields[2].to_owned(),
          name: fields[3].to_owned(),
          password: fields[4].to_owned(),
        });
      } else {
        return Err(Errno::EUCLEAN(format!("users.txt: malformed line '{line}'")));
      }
    }
    Ok(Self { records })
  }

  pub fn serialize(&self) -> String {
    self
      .records
      .iter()
      .map(|record| format!("{record}\n"))
      .join("")
  }

  pub fn records(&self) -> &[Record] {
    &self.records
  }

  /// Gid of an active group.
  pub fn group(&self, name: &str) -> Option<i32> {
    self.records.iter().find_map(|record| match record {
      Record::Group { gid, name: group } if *gid != 0 && group == name => Some(*gid),
      _ => None,
    })
  }

  pub fn group_name(&self, gid: i32) -> Option<String> {
    self.records.iter().find_map(|record| match record {
      Record::Group { gid: id, name } if *id == gid && gid != 0 => Some(name.clone()),
      _ => None,
    })
  }

  pub fn user_name(&self, uid: i32) -> Option<String> {
    self.records.iter().find_map(|record| match record {
      Record::User { uid: id, name, .. } if *id == uid && uid != 0 => Some(name.clone()),
      _ => None,
    })
  }

  fn user_record(&self, name: &str) -> Option<&Record> {
    self
      .records
      .iter()
      .find(|record| matches!(record, Record::User { uid, name: user, .. } if *uid != 0 && user == name))
  }

  pub fn account(&self, name: &str) -> Option<Account> {
    match self.user_record(name)? {
      Record::User { uid, group, name, .. } => Some(Account {
        uid: *uid,
        gid: self.group(group).unwrap_or(0),
        name: name.clone(),
        group: group.clone(),
      }),
      Record::Group { .. } => None,
    }
  }

  pub fn authenticate(&self, name: &str, password: &str) -> Result<Account, Errno> {
    match self.user_record(name) {
      Some(Record::User { password: stored, .. }) if stored == password => self
        .account(name)
        .ok_or_else(|| Errno::ENOENT(format!("user '{name}' does not exist"))),
      Some(_) => Err(Errno::EACCES(format!("wrong password for '{name}'"))),
      None => Err(Errno::ENOENT(format!("user '{name}' does not exist"))),
    }
  }

  pub fn add_group(&mut self, name: &str) -> Result<i32, Errno> {
    validate_field("group name", name)?;
    if self.group(name).is_some() {
      return Err(Errno::EEXIST(format!("group '{name}' already exists")));
    }
    let gid = self
      .records
      .iter()
      .filter(|record| matches!(record, Record::Group { .. }))
      .count() as i32
      + 1;
    self.records.push(Record::Group { gid, name: name.to_owned() });
    Ok(gid)
  }

  pub fn remove_group(&mut self, name: &str) -> Result<(), Errno> {
    if name == "root" {
      return Err(Errno::EPERM(String::from("the root group cannot be removed")));
    }
    if let Some(member) = self.records.iter().find_map(|record| match record {
      Record::User { uid, group, name: user, .. } if *uid != 0 && group == name => Some(user),
      _ => None,
    }) {
      return Err(Errno::EBUSY(format!("group '{name}' still has members, e.g. '{member}'")));
    }
    let record = self
      .records
      .iter_mut()
      .find(|record| matches!(record, Record::Group { gid, name: group } if *gid != 0 && group == name))
      .ok_or_else(|| Errno::ENOENT(format!("group '{name}' does not exist")))?;
    record.delete();
    Ok(())
  }

  pub fn add_user(&mut self, name: &str, password: &str, group: &str) -> Result<i32, Errno> {
    validate_field("user name", name)?;
    validate_field("password", password)?;
    validate_field("group name", group)?;
    if self.user_record(name).is_some() {
      return Err(Errno::EEXIST(format!("user '{name}' already exists")));
    }
    if self.group(group).is_none() {
      return Err(Errno::ENOENT(format!("group '{group}' does not exist")));
    }
    let uid = self
      .records
      .iter()
      .filter(|record| matches!(record, Record::User { .. }))
      .count() as i32
      + 1;
    self.records.push(Record::User {
      uid,
      group: group.to_owned(),
      name: name.to_owned(),
      password: password.to_owned(),
    });
    Ok(uid)
  }

  pub fn remove_user(&mut self, name: &str) -> Result<(), Errno> {
    if name == "root" {
      return Err(Errno::EPERM(String::from("the root user cannot be removed")));
    }
    let record = self
      .records
      .iter_mut()
      .find(|record| matches!(record, Record::User { uid, name: user, .. } if *uid != 0 && user == name))
      .ok_or_else(|| Errno::ENOENT(format!("user '{name}' does not exist")))?;
    record.delete();
    Ok(())
  }

  pub fn change_group(&mut self, name: &str, new_group: &str) -> Result<(), Errno> {
    if self.group(new_group).is_none() {
      return Err(Errno::ENOENT(format!("group '{new_group}' does not exist")));
    }
    let record = self
      .records
      .iter_mut()
      .find(|record| matches!(record, Record::User { uid, name: user, .. } if *uid != 0 && user == name))
      .ok_or_else(|| Errno::ENOENT(format!("user '{name}' does not exist")))?;
    if let Record::User { group, .. } = record {
      if group == new_group {
        return Err(Errno::EEXIST(format!("user '{name}' is already in '{new_group}'")));
      }
      *group = new_group.to_owned();
    }
    Ok(())
  }
}

impl ExtFilesystem {
  pub fn users(&mut self) -> Result<Users, Errno> {
    let (_, inode) = self.resolve(USERS_PATH)?;
    let content = self.read_content(&inode)?;
    Users::parse(&String::from_utf8_lossy(&content))
  }

  /// Root-only read-modify-write of users.txt, journaled as `operation`.
  fn update_users<T, F>(
    &mut self,
    credentials: &Credentials,
    operation: &str,
    name: &str,
    content: &str,
    update: F,
  ) -> Result<T, Errno>
  where
    F: FnOnce(&mut Users) -> Result<T, Errno>,
  {
    if !credentials.is_root() {
      return Err(Errno::EPERM(format!("{operation}: only root may manage users and groups")));
    }
    self.ensure_journal_room()?;

    let mut users = self.users()?;
    let value = update(&mut users)?;
    let (index, mut inode) = self.resolve(USERS_PATH)?;
    self.replace_content(index, &mut inode, users.serialize().as_bytes())?;

    info!("{operation}: {name}");
    self.record(operation, name, content.as_bytes())?;
    Ok(value)
  }

  pub fn mkgrp(&mut self, credentials: &Credentials, name: &str) -> Result<i32, Errno> {
    self.update_users(credentials, "mkgrp", name, "", |users| users.add_group(name))
  }

  pub fn rmgrp(&mut self, credentials: &Credentials, name: &str) -> Result<(), Errno> {
    self.update_users(credentials, "rmgrp", name, "", |users| users.remove_group(name))
  }

  pub fn mkusr(&mut self, credentials: &Credentials, name: &str, password: &str, group: &str) -> Result<i32, Errno> {
    let content = format!("{password},{group}");
    self.update_users(credentials, "mkusr", name, &content, |users| users.add_user(name, password, group))
  }

  pub fn rmusr(&mut self, credentials: &Credentials, name: &str) -> Result<(), Errno> {
    self.update_users(credentials, "rmusr", name, "", |users| users.remove_user(name))
  }

  pub fn chgrp(&mut self, credentials: &Credentials, name: &str, group: &str) -> Result<(), Errno> {
    self.update_users(credentials, "chgrp", name, group, |users| users.change_group(name, group))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::extfs::fs::tests::formatted;

  #[test]
  fn parse_and_serialize_default() {
    let users = Users::parse(USERS_DEFAULT).unwrap();
    assert_eq!(users.records().len(), 2);
    assert_eq!(users.group("root"), Some(1));
    assert_eq!(users.serialize(), USERS_DEFAULT);

    let root = users.authenticate("root", "123").unwrap();
    assert_eq!((root.uid, root.gid), (1, 1));
    assert!(matches!(users.authenticate("root", "nope"), Err(Errno::EACCES(_))));
    assert!(matches!(users.authenticate("ghost", "123"), Err(Errno::ENOENT(_))));
  }

  #[test]
  fn malformed_lines_are_corruption() {
    assert!(matches!(Users::parse("1,G,root\nx,U,a\n"), Err(Errno::EUCLEAN(_))));
    assert!(matches!(Users::parse("1,X,root\n"), Err(Errno::EUCLEAN(_))));
    assert!(Users::parse("\n1,G,root\n\n").is_ok());
  }

  #[test]
  fn ids_are_never_reused() {
    let mut users = Users::parse(USERS_DEFAULT).unwrap();
    assert_eq!(users.add_group("devs").unwrap(), 2);
    users.remove_group("devs").unwrap();
    assert_eq!(users.group("devs"), None);
    assert_eq!(users.add_group("devs").unwrap(), 3);

    assert_eq!(users.add_user("alice", "abc", "devs").unwrap(), 2);
    users.remove_user("alice").unwrap();
    assert!(users.account("alice").is_none());
    assert_eq!(users.add_user("alice", "xyz", "devs").unwrap(), 3);
    assert!(users.serialize().contains("0,U,devs,alice,abc\n"));
  }

  #[test]
  fn groups_with_members_stay() {
    let mut users = Users::parse(USERS_DEFAULT).unwrap();
    users.add_group("devs").unwrap();
    users.add_user("alice", "pw", "devs").unwrap();

    assert!(matches!(users.remove_group("devs"), Err(Errno::EBUSY(_))));
    let alice = users.authenticate("alice", "pw").unwrap();
    assert_eq!((alice.uid, alice.gid), (2, 2));
    assert!(users.serialize().contains("2,G,devs\n"));

    users.remove_user("alice").unwrap();
    users.remove_group("devs").unwrap();
    assert!(users.serialize().contains("0,G,devs\n"));
  }

  #[test]
  fn user_rules() {
    let mut users = Users::parse(USERS_DEFAULT).unwrap();
    assert!(matches!(users.add_user("bob", "pw", "nogroup"), Err(Errno::ENOENT(_))));
    assert!(matches!(users.add_user("root", "pw", "root"), Err(Errno::EEXIST(_))));
    assert!(matches!(users.add_user("averylongname", "pw", "root"), Err(Errno::EINVAL(_))));
    assert!(matches!(users.remove_user("root"), Err(Errno::EPERM(_))));
    assert!(matches!(users.remove_group("root"), Err(Errno::EPERM(_))));

    users.add_group("ops").unwrap();
    users.add_user("bob", "pw", "root").unwrap();
    users.change_group("bob", "ops").unwrap();
    assert_eq!(users.account("bob").unwrap().gid, 2);
    assert!(matches!(users.change_group("bob", "ops"), Err(Errno::EEXIST(_))));
  }

  #[test]
  fn users_file_on_disk() {
    let (mut fs, path) = formatted(3);
    let root = Credentials::root();

    fs.mkgrp(&root, "devs").unwrap();
    fs.mkusr(&root, "alice", "abc", "devs").unwrap();
    let (_, inode) = fs.resolve(USERS_PATH).unwrap();
    let content = String::from_utf8(fs.read_content(&inode).unwrap()).unwrap();
    assert!(content.ends_with("2,G,devs\n2,U,devs,alice,abc\n"));

    let alice = fs.users().unwrap().account("alice").unwrap();
    assert!(matches!(fs.mkgrp(&alice.credentials(), "x"), Err(Errno::EPERM(_))));

    let journal = fs.journal().unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[1].operation(), "mkusr");
    assert_eq!(journal[1].path(), "alice");
    assert_eq!(journal[1].content(), "abc,devs");

    drop(fs);
    std::fs::remove_file(path).unwrap();
  }
}

// vim:ts=2 sw=2
