//! Seekable byte streams.
//!
//! Every reader and writer in this crate works on a `MediaStream`. The trait
//! is a small capability contract: a stream says up front whether it can be
//! read, written, seeked or rewound, and the component that needs one of
//! those checks it once when it is constructed.
//!
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Byte stream with capability queries.
pub trait MediaStream {
    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Skip up to `amount` bytes, returns the number of bytes skipped.
    fn skip(&mut self, amount: u64) -> io::Result<u64>;

    /// Bytes left until the end of the stream.
    fn available(&mut self) -> io::Result<u64>;

    /// Go back to offset 0.
    fn rewind(&mut self) -> io::Result<()>;

    /// Absolute positioning.
    fn seek(&mut self, _pos: u64) -> io::Result<()> {
        Err(ioerr!(Unsupported, "stream is not seekable"))
    }

    /// Write all of `data`.
    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(ioerr!(Unsupported, "stream is not writable"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;
    fn can_seek(&self) -> bool;
    fn can_rewind(&self) -> bool;

    /// Total length of the stream.
    fn length(&mut self) -> io::Result<u64>;

    /// Read until `buf` is full or the stream ends.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
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
}

// Forwarding impls, so that `&mut dyn MediaStream` and
// `Box<dyn MediaStream>` can be handed to the generic readers and writers.
macro_rules! forward_media_stream {
    ($($ty:ty),*) => {$(
        impl<T: MediaStream + ?Sized> MediaStream for $ty {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                (**self).read(buf)
            }
            fn skip(&mut self, amount: u64) -> io::Result<u64> {
                (**self).skip(amount)
            }
            fn available(&mut self) -> io::Result<u64> {
                (**self).available()
            }
            fn rewind(&mut self) -> io::Result<()> {
                (**self).rewind()
            }
            fn seek(&mut self, pos: u64) -> io::Result<()> {
                (**self).seek(pos)
            }
            fn write(&mut self, data: &[u8]) -> io::Result<()> {
                (**self).write(data)
            }
            fn flush(&mut self) -> io::Result<()> {
                (**self).flush()
            }
            fn close(&mut self) -> io::Result<()> {
                (**self).close()
            }
            fn is_closed(&self) -> bool {
                (**self).is_closed()
            }
            fn can_read(&self) -> bool {
                (**self).can_read()
            }
            fn can_write(&self) -> bool {
                (**self).can_write()
            }
            fn can_seek(&self) -> bool {
                (**self).can_seek()
            }
            fn can_rewind(&self) -> bool {
                (**self).can_rewind()
            }
            fn length(&mut self) -> io::Result<u64> {
                (**self).length()
            }
            fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                (**self).read_full(buf)
            }
        }
    )*}
}

forward_media_stream!(&mut T, Box<T>);

/// A stream on top of a file.
pub struct FileStream {
    file:     Option<fs::File>,
    writable: bool,
}

impl FileStream {
    /// Open an existing file, read-only.
    pub fn open(path: impl AsRef<Path>) -> io::Result<FileStream> {
        let file = fs::File::open(path)?;
        Ok(FileStream { file: Some(file), writable: false })
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<FileStream> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileStream { file: Some(file), writable: true })
    }

    pub fn from_file(file: fs::File, writable: bool) -> FileStream {
        FileStream { file: Some(file), writable }
    }

    fn file(&mut self) -> io::Result<&mut fs::File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(ioerr!(io::ErrorKind::NotConnected, "stream is closed")),
        }
    }

    fn pos(&mut self) -> io::Result<u64> {
        self.file()?.seek(SeekFrom::Current(0))
    }
}

impl MediaStream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file()?.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn skip(&mut self, amount: u64) -> io::Result<u64> {
        let pos = self.pos()?;
        let mut amount = amount;
        if !self.writable {
            let len = self.length()?;
            amount = std::cmp::min(amount, len.saturating_sub(pos));
        }
        self.file()?.seek(SeekFrom::Start(pos + amount))?;
        Ok(amount)
    }

    fn available(&mut self) -> io::Result<u64> {
        let pos = self.pos()?;
        Ok(self.length()?.saturating_sub(pos))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.file()?.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file()?.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(ioerr!(Unsupported, "stream is not writable"));
        }
        self.file()?.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            if self.writable {
                file.flush()?;
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn can_read(&self) -> bool {
        self.file.is_some()
    }

    fn can_write(&self) -> bool {
        self.file.is_some() && self.writable
    }

    fn can_seek(&self) -> bool {
        self.file.is_some()
    }

    fn can_rewind(&self) -> bool {
        self.file.is_some()
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }
}

/// An in-memory stream. Reads, writes, seeks and rewinds.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data:   Vec<u8>,
    pos:    usize,
    closed: bool,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        MemoryStream::default()
    }

    /// Stream over existing data, positioned at the start.
    pub fn from_vec(data: Vec<u8>) -> MemoryStream {
        MemoryStream { data, pos: 0, closed: false }
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl MediaStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, amount: u64) -> io::Result<u64> {
        let left = self.data.len().saturating_sub(self.pos) as u64;
        let amount = std::cmp::min(amount, left);
        self.pos += amount as usize;
        Ok(amount)
    }

    fn available(&mut self) -> io::Result<u64> {
        Ok(self.data.len().saturating_sub(self.pos) as u64)
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.pos = pos as usize;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let end = self.pos + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn can_rewind(&self) -> bool {
        true
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// The byte range `[start, end)` of another stream, presented as a
/// stream of its own that starts at offset 0.
///
/// The inner stream must be seekable. Closing a `ChunkStream` does not
/// close the inner stream.
pub struct ChunkStream<S> {
    inner:  S,
    start:  u64,
    end:    u64,
    pos:    u64,
    closed: bool,
}

impl<S: MediaStream> ChunkStream<S> {
    pub fn new(mut inner: S, start: u64, end: u64) -> io::Result<ChunkStream<S>> {
        if !inner.can_seek() {
            return Err(ioerr!(Unsupported, "chunk stream needs a seekable source"));
        }
        if end < start {
            return Err(ioerr!(InvalidInput, "chunk stream range {}..{} is reversed", start, end));
        }
        inner.seek(start)?;
        Ok(ChunkStream {
            inner,
            start,
            end,
            pos: 0,
            closed: false,
        })
    }

    /// Absolute position in the inner stream.
    pub fn file_pointer(&self) -> u64 {
        self.start + self.pos
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn left(&self) -> u64 {
        (self.end - self.start).saturating_sub(self.pos)
    }
}

impl<S: MediaStream> MediaStream for ChunkStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = std::cmp::min(buf.len() as u64, self.left()) as usize;
        if n == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn skip(&mut self, amount: u64) -> io::Result<u64> {
        let amount = std::cmp::min(amount, self.left());
        self.pos += amount;
        self.inner.seek(self.start + self.pos)?;
        Ok(amount)
    }

    fn available(&mut self) -> io::Result<u64> {
        Ok(self.left())
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        self.inner.seek(self.start)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.pos = std::cmp::min(pos, self.end - self.start);
        self.inner.seek(self.start + self.pos)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn can_read(&self) -> bool {
        !self.closed
    }

    fn can_write(&self) -> bool {
        false
    }

    fn can_seek(&self) -> bool {
        !self.closed
    }

    fn can_rewind(&self) -> bool {
        !self.closed
    }

    fn length(&mut self) -> io::Result<u64> {
        Ok(self.end - self.start)
    }
}
