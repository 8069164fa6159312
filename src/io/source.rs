//! Byte sources the engine can read from.
//!
//! A [`ByteSource`] is owned by the caller and only borrowed by a
//! [`Device`](super::Device) for the duration of one operation. The engine
//! never creates locks of its own: sharing one stream between threads goes
//! through [`SharedSource`], which wraps a lock supplied by the caller and
//! holds it for exactly one positioned read or write.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Positioned, seekable access to a stream of bytes.
///
/// Implementations may return fewer bytes than requested from
/// [`read_at`](ByteSource::read_at); the caller treats a short count as the
/// end of the available data.
pub trait ByteSource {
    /// Current length, or `None` if the stream cannot report one.
    fn size(&self) -> Option<u64>;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `data` at `offset`, returning the count written.
    ///
    /// Read-only sources keep the default, which refuses every write.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let _ = (offset, data);
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "byte source is read-only",
        ))
    }

    /// Whether a write past the end extends the stream.
    fn is_growable(&self) -> bool {
        false
    }
}

/// Seek then read until `buf` is full or the reader reports end of stream.
fn read_full<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<usize> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut done = 0;
    while done < buf.len() {
        match reader.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn copy_from_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

impl ByteSource for File {
    fn size(&self) -> Option<u64> {
        self.metadata().ok().map(|m| m.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_full(self, offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)?;
        Ok(data.len())
    }

    fn is_growable(&self) -> bool {
        true
    }
}

impl ByteSource for Vec<u8> {
    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice(self, offset, buf))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        if end > self.len() {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn is_growable(&self) -> bool {
        true
    }
}

impl ByteSource for &[u8] {
    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice(self, offset, buf))
    }
}

impl ByteSource for &mut [u8] {
    fn size(&self) -> Option<u64> {
        Some(self.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice(self, offset, buf))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = data.len().min(self.len() - start);
        self[start..start + n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

/// Read-only adapter for any seekable reader.
///
/// The size is probed once by seeking to the end; readers that cannot seek
/// there report an unknown size.
#[derive(Debug)]
pub struct StreamSource<R> {
    inner: R,
    size: Option<u64>,
}

impl<R: Read + Seek> StreamSource<R> {
    /// Wrap `inner`, probing its length.
    pub fn new(mut inner: R) -> Self {
        let size = inner.seek(SeekFrom::End(0)).ok();
        Self { inner, size }
    }

    /// Unwrap the reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> ByteSource for StreamSource<R> {
    fn size(&self) -> Option<u64> {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_full(&mut self.inner, offset, buf)
    }
}

/// A source shared between threads through a caller-supplied lock.
///
/// The lock is taken once per `size`, `read_at` or `write_at` call and is
/// never held across a multi-step scan, so several readers interleave at
/// I/O-call granularity.
#[derive(Debug)]
pub struct SharedSource<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ByteSource> SharedSource<S> {
    /// Share `inner` behind the caller's lock.
    pub fn new(inner: Arc<Mutex<S>>) -> Self {
        Self { inner }
    }

    /// The underlying lock.
    pub fn lock_handle(&self) -> &Arc<Mutex<S>> {
        &self.inner
    }
}

impl<S: ByteSource> ByteSource for SharedSource<S> {
    fn size(&self) -> Option<u64> {
        self.inner.lock().size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_at(offset, data)
    }

    fn is_growable(&self) -> bool {
        self.inner.lock().is_growable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_slice_short_read() {
        let mut src: &[u8] = b"hello";
        let mut buf = [0u8; 8];
        assert_eq!(src.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(src.read_at(10, &mut buf).unwrap(), 0);
        assert!(src.write_at(0, b"x").is_err());
    }

    #[test]
    fn test_vec_grows() {
        let mut src = vec![1u8, 2];
        assert!(src.is_growable());
        src.write_at(4, &[9]).unwrap();
        assert_eq!(src, vec![1, 2, 0, 0, 9]);
    }

    #[test]
    fn test_mut_slice_fixed() {
        let mut backing = [0u8; 4];
        let mut src: &mut [u8] = &mut backing;
        assert_eq!(src.write_at(2, &[7, 8, 9]).unwrap(), 2);
        assert_eq!(backing, [0, 0, 7, 8]);
    }

    #[test]
    fn test_stream_source() {
        let mut src = StreamSource::new(Cursor::new(b"abcdef".to_vec()));
        assert_eq!(src.size(), Some(6));
        let mut buf = [0u8; 3];
        assert_eq!(src.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"\x7FELF").unwrap();
        assert_eq!(ByteSource::size(&file), Some(4));
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\x7FELF");
    }

    #[test]
    fn test_shared_source_across_threads() {
        let lock = Arc::new(Mutex::new(vec![0u8; 16]));
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let mut src = SharedSource::new(Arc::clone(&lock));
                std::thread::spawn(move || {
                    src.write_at(u64::from(i) * 4, &[i; 4]).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let data = lock.lock();
        for i in 0..4u8 {
            assert_eq!(&data[i as usize * 4..i as usize * 4 + 4], &[i; 4]);
        }
    }
}
