// Random-access byte sources the volume reads ciphertext from.
use std::io::{self, Read, Seek, SeekFrom};

/// Random-access view of the storage that holds a BitLocker volume.
///
/// Every `Read + Seek` type (files, `Cursor<Vec<u8>>`, block devices) is a
/// `ByteSource` through the blanket impl below; other storage back ends can
/// implement the two methods directly.
pub trait ByteSource {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// A short read is an error (`io::ErrorKind::UnexpectedEof`).
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total size of the source in bytes.
    fn size(&mut self) -> io::Result<u64>;
}

impl<T: Read + Seek> ByteSource for T {
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        let current = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(current))?;
        Ok(end)
    }
}

// A source shifted by a fixed base offset, for volumes stored inside a
// larger disk image.
pub(crate) struct SourceWindow<S> {
    inner: S,
    base: u64,
}

impl<S: ByteSource> SourceWindow<S> {
    pub(crate) fn new(inner: S, base: u64) -> Self {
        Self { inner, base }
    }

    pub(crate) fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let absolute = self.base.checked_add(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Source offset overflow")
        })?;
        log::trace!("Reading {} bytes at source offset 0x{:x}", buf.len(), absolute);
        self.inner.read_exact_at(absolute, buf)
    }

    // Size of the window, i.e. everything past the base offset.
    pub(crate) fn size(&mut self) -> io::Result<u64> {
        let size = self.inner.size()?;
        size.checked_sub(self.base).ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "Volume offset beyond end of source")
        })
    }

    pub(crate) fn into_inner(self) -> S {
        self.inner
    }
}
