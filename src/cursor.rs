use crate::{corrupt, CryptoError};

/// Bounds-checked little-endian reader over a borrowed byte slice.
///
/// Reads never copy; callers decide when a field gets materialized.
#[derive(Debug, Clone)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteCursor { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn take(&mut self, len: usize, context: &'static str) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| corrupt(self.pos, context))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;

        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N], CryptoError> {
        let bytes = self.take(N, context)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);

        Ok(out)
    }

    pub fn read_u16(&mut self, context: &'static str) -> Result<u16, CryptoError> {
        self.take_array(context).map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, CryptoError> {
        self.take_array(context).map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64, CryptoError> {
        self.take_array(context).map(u64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields_in_order() {
        let data = [0x04, 0x00, 0x04, 0x00, 0x40, 0x00, 0x00, 0x00, 0xAA];
        let mut cursor = ByteCursor::new(&data);

        assert_eq!(cursor.read_u16("minor").unwrap(), 4);
        assert_eq!(cursor.read_u16("major").unwrap(), 4);
        assert_eq!(cursor.read_u32("flags").unwrap(), 0x40);
        assert_eq!(cursor.position(), 8);
        assert_eq!(cursor.remaining(), &[0xAA]);
    }

    #[test]
    fn truncated_read_reports_offset_and_does_not_advance() {
        let data = [1, 2, 3, 4, 5];
        let mut cursor = ByteCursor::new(&data);
        cursor.read_u32("first").unwrap();

        match cursor.read_u32("second") {
            Err(CryptoError::ContainerCorrupt { offset, context }) => {
                assert_eq!(offset, 4);
                assert_eq!(context, "second");
            }
            other => panic!("expected ContainerCorrupt, got {other:?}"),
        }
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn huge_take_does_not_overflow() {
        let data = [0u8; 4];
        let mut cursor = ByteCursor::new(&data);
        cursor.take(2, "head").unwrap();

        assert!(cursor.take(usize::MAX, "tail").is_err());
    }
}
