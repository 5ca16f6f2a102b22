// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Offset-windowed access to a volume inside a larger source.
//!
//! Partitioned devices and images carry the Core Storage volume at a
//! non-zero byte offset. [RangeReader] re-bases all seeks so the volume
//! header appears at position 0, the way the rest of the crate expects.

use std::io::{self, Read, Seek, SeekFrom};

/// A reader windowed to start at a fixed base offset.
#[derive(Debug)]
pub struct RangeReader<R> {
    inner: R,
    base: u64,
}

impl<R: Seek> RangeReader<R> {
    /// Wrap `inner`, positioning it at `base`.
    pub fn new(mut inner: R, base: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(base))?;

        Ok(Self { inner, base })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for RangeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for RangeReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let position = match pos {
            SeekFrom::Start(offset) => self.inner.seek(SeekFrom::Start(self.base + offset))?,
            other => self.inner.seek(other)?,
        };

        Ok(position.saturating_sub(self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rebases_reads_and_seeks() {
        let data: Vec<u8> = (0..=255).collect();
        let mut reader = RangeReader::new(Cursor::new(data), 100).unwrap();

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [100, 101, 102, 103]);

        assert_eq!(reader.seek(SeekFrom::Start(10)).unwrap(), 10);
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [110, 111, 112, 113]);

        assert_eq!(reader.seek(SeekFrom::Current(-4)).unwrap(), 10);
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [110, 111, 112, 113]);
    }

    #[test]
    fn zero_base_is_transparent() {
        let mut reader = RangeReader::new(Cursor::new(vec![7u8; 8]), 0).unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);
    }
}
