use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use auto_impl::auto_impl;
use memmap::{Mmap, MmapOptions};

use crate::stream::MediaStream;

/// Read-only stream over a memory mapped file.
pub struct MmapStream {
    mmap:   Option<Arc<Mmap>>,
    pos:    u64,
    size:   u64,
}

impl MmapStream {
    pub fn open(path: impl AsRef<Path>) -> io::Result<MmapStream> {
        let file = fs::File::open(path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            // mapping an empty file fails on most platforms.
            return Ok(MmapStream { mmap: None, pos: 0, size: 0 });
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(MmapStream {
            mmap: Some(Arc::new(mmap)),
            pos: 0,
            size,
        })
    }

    /// The part of the file that has not been read yet.
    pub fn remaining(&self) -> &[u8] {
        match self.mmap {
            Some(ref mmap) => &mmap[self.pos as usize..],
            None => &[],
        }
    }
}

impl MediaStream for MmapStream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = std::cmp::min(buf.len() as u64, self.size - self.pos) as usize;
        if n == 0 {
            return Ok(0);
        }
        buf[..n].copy_from_slice(&self.remaining()[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    #[inline]
    fn skip(&mut self, amount: u64) -> io::Result<u64> {
        let amount = std::cmp::min(amount, self.size - self.pos);
        self.pos += amount;
        Ok(amount)
    }

    fn available(&mut self) -> io::Result<u64> {
        Ok(self.size - self.pos)
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos > self.size {
            return Err(ioerr!(UnexpectedEof, "tried to seek past eof"));
        }
        self.pos = pos;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.mmap = None;
        self.size = 0;
        self.pos = 0;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.mmap.is_none() && self.size == 0
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        false
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.size)
    }
}

/// Destination for data that gets patched after it was written.
#[auto_impl(&mut)]
pub(crate) trait BoxSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn skip(&mut self, amount: u64) -> io::Result<()>;
    fn seek(&mut self, pos: u64) -> io::Result<()>;
    fn pos(&self) -> u64;

    /// True if nothing is stored, only counted.
    fn simulated(&self) -> bool {
        false
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write(&value.to_be_bytes())
    }
}

// Count bytes, don't actually write.
#[derive(Debug, Default)]
pub(crate) struct CountBytes {
    pos:    u64,
    max:    u64,
}

impl CountBytes {
    pub fn new() -> CountBytes {
        CountBytes {
            pos: 0,
            max: 0,
        }
    }

    /// Highest offset ever written.
    pub fn size(&self) -> u64 {
        self.max
    }
}

impl BoxSink for CountBytes {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.pos += data.len() as u64;
        if self.max < self.pos {
            self.max = self.pos;
        }
        Ok(())
    }

    fn skip(&mut self, amount: u64) -> io::Result<()> {
        self.pos += amount;
        if self.max < self.pos {
            self.max = self.pos;
        }
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.pos = pos;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn simulated(&self) -> bool {
        true
    }
}

/// Fixed size in-memory buffer with a cursor.
#[derive(Debug)]
pub(crate) struct MemBuffer {
    data:   Vec<u8>,
    pos:    usize,
}

impl MemBuffer {
    pub fn with_size(size: usize) -> MemBuffer {
        MemBuffer {
            data: vec![0u8; size],
            pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }
}

impl BoxSink for MemBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let end = self.pos + data.len();
        if end > self.data.len() {
            return Err(ioerr!(WriteZero, "buffer overflow: {} > {}", end, self.data.len()));
        }
        self.data[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn skip(&mut self, amount: u64) -> io::Result<()> {
        let pos = self.pos as u64 + amount;
        self.seek(pos)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos > self.data.len() as u64 {
            return Err(ioerr!(InvalidInput, "seek past end of buffer: {}", pos));
        }
        self.pos = pos as usize;
        Ok(())
    }

    fn pos(&self) -> u64 {
        self.pos as u64
    }
}
