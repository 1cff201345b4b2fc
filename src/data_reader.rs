//! Buffered big-endian reader on top of a `MediaStream`.
//!
//! The container parsers read headers through `DataReader` and payloads
//! through a `View`: a window of a fixed number of bytes starting at the
//! current position. The window budget lives in the reader itself, so it
//! survives across calls and is adjusted when the reader is rewound.
//!
use std::io;

use byteorder::{BigEndian, ByteOrder};

use crate::stream::MediaStream;

/// Size of the read-ahead buffer.
pub const BUFFER_SIZE: usize = 128 * 1024;

pub struct DataReader<S> {
    stream:     S,
    position:   u64,
    view_size:  u64,
    buffer:     Box<[u8]>,
    offset:     usize,
    count:      usize,
    eof:        bool,
}

impl<S: MediaStream> DataReader<S> {
    pub fn new(stream: S) -> DataReader<S> {
        DataReader {
            stream,
            position: 0,
            view_size: 0,
            buffer: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            offset: 0,
            count: 0,
            eof: false,
        }
    }

    /// Number of bytes consumed since the start (or the last rewind).
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    // Returns false at end of stream.
    fn fill_buffer(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.count == 0 {
            let n = self.stream.read(&mut self.buffer[..])?;
            if n == 0 {
                self.eof = true;
                return Ok(false);
            }
            self.offset = 0;
            self.count = n;
        }
        Ok(true)
    }

    /// Read a single byte, `None` at end of stream.
    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if !self.fill_buffer()? {
            return Ok(None);
        }
        let b = self.buffer[self.offset];
        self.offset += 1;
        self.count -= 1;
        self.position += 1;
        Ok(Some(b))
    }

    /// Read up to `buf.len()` bytes. A short count means end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut total = 0;

        if buf.len() >= self.buffer.len() {
            // large read, drain what is buffered and go to the stream directly.
            if self.count > 0 {
                let n = self.count;
                buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
                self.offset += n;
                self.count = 0;
                total = n;
            }
            total += self.stream.read_full(&mut buf[total..])?;
        } else {
            while total < buf.len() && self.fill_buffer()? {
                let n = std::cmp::min(self.count, buf.len() - total);
                buf[total..total + n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
                self.offset += n;
                self.count -= n;
                total += n;
            }
        }

        self.position += total as u64;
        Ok(total)
    }

    /// Skip bytes, returns the number of bytes actually skipped.
    pub fn skip_bytes(&mut self, amount: u64) -> io::Result<u64> {
        if self.eof {
            return Ok(0);
        }
        let skipped = if self.count as u64 > amount {
            self.count -= amount as usize;
            self.offset += amount as usize;
            amount
        } else {
            let buffered = self.count as u64;
            self.count = 0;
            buffered + self.stream.skip(amount - buffered)?
        };
        self.position += skipped;
        Ok(skipped)
    }

    /// True if there is at least one more byte to read.
    pub fn available(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        Ok(self.count > 0 || self.stream.available()? > 0)
    }

    pub fn can_rewind(&self) -> bool {
        self.stream.can_rewind()
    }

    /// Go back to the start of the stream.
    ///
    /// An open view stays usable if it started at offset 0; its budget
    /// is grown by the bytes that were already consumed from it.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.stream.rewind()?;

        if self.position > self.view_size {
            self.view_size = 0;
        } else {
            self.view_size += self.position;
        }

        self.position = 0;
        self.offset = 0;
        self.count = 0;
        self.eof = false;
        Ok(())
    }

    fn read_exact_n(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(ioerr!(UnexpectedEof, "Truncated stream, missing {} bytes", buf.len() - n));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_n(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        let mut buf = [0u8; 2];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_i16(&buf))
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_i32(&buf))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_i64(&buf))
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_n(&mut buf)?;
        Ok(BigEndian::read_u64(&buf))
    }

    /// Read exactly `size` bytes into a new vector.
    pub fn read_vec(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact_n(&mut buf)?;
        Ok(buf)
    }

    /// Open a view of `size` bytes at the current position.
    pub fn get_view(&mut self, size: u64) -> View<'_, S> {
        self.view_size = size;
        View { reader: self }
    }

    /// The currently open view, with whatever budget it has left.
    pub fn view(&mut self) -> View<'_, S> {
        View { reader: self }
    }
}

/// Bounded window over a `DataReader`.
///
/// Reading through the view consumes its budget. Reading the reader
/// directly does not.
pub struct View<'a, S> {
    reader: &'a mut DataReader<S>,
}

impl<'a, S: MediaStream> View<'a, S> {
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.view_size == 0 {
            return Ok(0);
        }
        let max = std::cmp::min(self.reader.view_size, buf.len() as u64) as usize;
        let n = self.reader.read(&mut buf[..max])?;
        self.reader.view_size -= n as u64;
        Ok(n)
    }

    /// Read until `buf` is full or the view is exhausted.
    pub fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.reader.view_size == 0 {
            return Ok(None);
        }
        let b = self.reader.read_byte()?;
        if b.is_some() {
            self.reader.view_size -= 1;
        }
        Ok(b)
    }

    pub fn skip(&mut self, amount: u64) -> io::Result<u64> {
        if self.reader.view_size == 0 {
            return Ok(0);
        }
        let n = self.reader.skip_bytes(std::cmp::min(amount, self.reader.view_size))?;
        self.reader.view_size -= n;
        Ok(n)
    }

    /// Budget left in the view.
    pub fn available(&self) -> u64 {
        self.reader.view_size
    }

    pub fn close(&mut self) {
        self.reader.view_size = 0;
    }

    /// Read whatever is left of the view.
    pub fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.available() as usize];
        let n = self.read_full(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl<'a, S: MediaStream> io::Read for View<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        View::read(self, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn reader(data: &[u8]) -> DataReader<MemoryStream> {
        DataReader::new(MemoryStream::from_vec(data.to_vec()))
    }

    #[test]
    fn test_primitives() {
        let mut r = reader(&[
            0x00, 0x00, 0x00, 0x2a,
            0xff, 0xfe,
            0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
            0x80, 0x00, 0x00, 0x00,
        ]);
        assert_eq!(r.read_i32().unwrap(), 42);
        assert_eq!(r.read_i16().unwrap(), -2);
        assert_eq!(r.read_u64().unwrap(), 0x1_0000_0002);
        assert_eq!(r.read_u32().unwrap(), 0x8000_0000);
        assert_eq!(r.position(), 18);
        assert!(!r.available().unwrap());
    }

    #[test]
    fn test_truncated_primitive() {
        let mut r = reader(&[1, 2]);
        let err = r.read_i32().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("missing 2 bytes"));
    }

    #[test]
    fn test_read_byte_at_eof() {
        let mut r = reader(&[7]);
        assert_eq!(r.read_byte().unwrap(), Some(7));
        assert_eq!(r.read_byte().unwrap(), None);
        assert_eq!(r.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_skip_within_and_past_buffer() {
        let data: Vec<u8> = (0..=255).collect();
        let mut r = reader(&data);
        assert_eq!(r.read_u8().unwrap(), 0);
        assert_eq!(r.skip_bytes(9).unwrap(), 9);
        assert_eq!(r.read_u8().unwrap(), 10);
        assert_eq!(r.skip_bytes(1000).unwrap(), 245);
        assert_eq!(r.position(), 256);
        assert!(!r.available().unwrap());
    }

    #[test]
    fn test_large_read_bypasses_buffer() {
        let data: Vec<u8> = (0..BUFFER_SIZE + 100).map(|i| i as u8).collect();
        let mut r = reader(&data);
        assert_eq!(r.read_u8().unwrap(), 0);
        let mut buf = vec![0u8; BUFFER_SIZE + 50];
        assert_eq!(r.read(&mut buf).unwrap(), BUFFER_SIZE + 50);
        assert_eq!(buf[0], 1);
        assert_eq!(buf[BUFFER_SIZE + 49], ((BUFFER_SIZE + 50) % 256) as u8);
        let mut rest = [0u8; 100];
        assert_eq!(r.read(&mut rest).unwrap(), 49);
    }

    #[test]
    fn test_view_budget() {
        let mut r = reader(b"abcdefghij");
        r.skip_bytes(2).unwrap();
        let mut view = r.get_view(5);
        let mut buf = [0u8; 16];
        assert_eq!(view.read(&mut buf[..2]).unwrap(), 2);
        assert_eq!(&buf[..2], b"cd");
        assert_eq!(view.available(), 3);
        assert_eq!(view.skip(1).unwrap(), 1);
        assert_eq!(view.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"fg");
        assert_eq!(view.read(&mut buf).unwrap(), 0);
        // direct reads do not touch the budget.
        assert_eq!(r.read_u8().unwrap(), b'h');
    }

    #[test]
    fn test_view_close_and_io_read() {
        use std::io::Read;
        let mut r = reader(b"0123456789");
        let mut s = String::new();
        r.get_view(4).read_to_string(&mut s).unwrap();
        assert_eq!(s, "0123");
        let mut view = r.get_view(4);
        view.close();
        assert_eq!(view.available(), 0);
        assert_eq!(view.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_rewind_keeps_view_from_start() {
        let mut r = reader(b"0123456789");
        {
            let mut view = r.get_view(6);
            let mut buf = [0u8; 2];
            assert_eq!(view.read(&mut buf).unwrap(), 2);
        }
        r.rewind().unwrap();
        assert_eq!(r.position(), 0);
        // 4 left + 2 consumed.
        assert_eq!(r.view().available(), 6);

        r.skip_bytes(8).unwrap();
        r.get_view(1);
        r.rewind().unwrap();
        assert_eq!(r.view().available(), 0);
        assert_eq!(r.read_u8().unwrap(), b'0');
    }
}
