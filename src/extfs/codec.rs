use super::kernel::Errno;

/// Fixed-size little-endian on-disk record.
pub trait Record: Sized {
  const SIZE: usize;

  fn encode(&self) -> Vec<u8>;
  fn decode(bytes: &[u8]) -> Result<Self, Errno>;
}

/// Cursor over an encoded record. Running past the end is corruption.
pub struct Reader<'a> {
  bytes: &'a [u8],
  position: usize,
}

impl<'a> Reader<'a> {
  pub fn new(bytes: &'a [u8]) -> Self {
    Self { bytes, position: 0 }
  }

  pub fn take(&mut self, count: usize) -> Result<&'a [u8], Errno> {
    let end = self.position + count;
    if end > self.bytes.len() {
      return Err(Errno::EUCLEAN(format!(
        "record truncated: need {end} bytes, have {}",
        self.bytes.len()
      )));
    }
    let slice = &self.bytes[self.position..end];
    self.position = end;
    Ok(slice)
  }

  pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Errno> {
    let mut array = [0u8; N];
    array.copy_from_slice(self.take(N)?);
    Ok(array)
  }

  pub fn u8(&mut self) -> Result<u8, Errno> {
    Ok(self.take(1)?[0])
  }

  pub fn i32(&mut self) -> Result<i32, Errno> {
    Ok(i32::from_le_bytes(self.array()?))
  }

  pub fn i64(&mut self) -> Result<i64, Errno> {
    Ok(i64::from_le_bytes(self.array()?))
  }

  pub fn f32(&mut self) -> Result<f32, Errno> {
    Ok(f32::from_le_bytes(self.array()?))
  }
}

/// Check that `encode` emits exactly `SIZE` bytes for a sample value.
pub fn verify<T: Record + Default>(name: &str) -> Result<(), Errno> {
  let encoded = T::default().encode().len();
  if encoded != T::SIZE {
    return Err(Errno::EUCLEAN(format!(
      "{name}: encoded size {encoded} differs from layout size {}",
      T::SIZE
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reader_reads_little_endian() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&7i32.to_le_bytes());
    bytes.extend_from_slice(&(-1i64).to_le_bytes());
    bytes.push(b'x');

    let mut reader = Reader::new(&bytes);
    assert_eq!(reader.i32().unwrap(), 7);
    assert_eq!(reader.i64().unwrap(), -1);
    assert_eq!(reader.u8().unwrap(), b'x');
  }

  #[test]
  fn reader_reports_truncation() {
    let bytes = [1u8, 2, 3];
    let mut reader = Reader::new(&bytes);
    match reader.i64() {
      Err(Errno::EUCLEAN(_)) => (),
      other => panic!("expected EUCLEAN, got {other:?}"),
    }
  }
}

// vim:ts=2 sw=2
