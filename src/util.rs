use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Apply `f` until the value stops changing.
pub fn fixedpoint<T, F>(f: F, mut value: T) -> T
where
  T: PartialEq + Clone,
  F: Fn(&T) -> T,
{
  loop {
    let next = f(&value);
    if next == value {
      return value;
    }
    value = next;
  }
}

pub fn unixtime() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|duration| duration.as_secs() as i64)
    .unwrap_or(0)
}

pub fn unixtime_f32() -> f32 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|duration| duration.as_secs_f32())
    .unwrap_or(0.0)
}

pub fn human_time(timestamp: i64) -> String {
  match NaiveDateTime::from_timestamp_opt(timestamp, 0) {
    Some(naive) => DateTime::<Utc>::from_utc(naive, Utc)
      .format("%Y-%m-%d %H:%M:%S")
      .to_string(),
    None => String::from("-"),
  }
}

/// Copy `string` into a fixed NUL-padded array, truncating if needed.
pub fn to_fixed<const N: usize>(string: &str) -> [u8; N] {
  let mut array = [0u8; N];
  let bytes = string.as_bytes();
  let len = bytes.len().min(N);
  array[..len].copy_from_slice(&bytes[..len]);
  array
}

/// Read a NUL-terminated string out of a fixed array.
pub fn from_fixed(bytes: &[u8]) -> String {
  let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
  String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Gets the bit at position `n`. Bits are numbered from 0 (least significant).
pub fn get_bit_at(input: u8, n: u8) -> bool {
  if n < 8 {
    input & (1 << n) != 0
  } else {
    false
  }
}

/// Unique path in the system temp directory. Nothing is created.
pub fn mktemp() -> PathBuf {
  std::env::temp_dir().join(format!("vdiskfs-{}", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fixedpoint_collapses_slashes() {
    let collapsed = fixedpoint(|s: &String| s.replace("//", "/"), String::from("a////b"));
    assert_eq!(collapsed, "a/b");
  }

  #[test]
  fn fixed_strings_are_nul_terminated() {
    let fixed: [u8; 6] = to_fixed("abc");
    assert_eq!(fixed, [b'a', b'b', b'c', 0, 0, 0]);
    assert_eq!(from_fixed(&fixed), "abc");
  }

  #[test]
  fn fixed_strings_truncate() {
    let fixed: [u8; 4] = to_fixed("abcdef");
    assert_eq!(from_fixed(&fixed), "abcd");
  }

  #[test]
  fn get_bit_at_works() {
    assert!(get_bit_at(0b100, 2));
    assert!(!get_bit_at(0b100, 1));
    assert!(!get_bit_at(0xff, 9));
  }

  #[test]
  fn mktemp_is_unique() {
    assert_ne!(mktemp(), mktemp());
  }
}

// vim:ts=2 sw=2
