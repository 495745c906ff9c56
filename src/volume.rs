use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::time::SystemTime;

use uuid::Uuid;

use crate::crypto::{EncryptionContext, EncryptionMethod};
use crate::error::{ArgumentError, Error, FormatError, Result};
use crate::header::{BootSector, FormatVersion, VolumeHeader};
use crate::keys::{resolve_keys, AbortSignal, Credential};
use crate::metadata::{
    filetime_to_system_time, KeyProtector, Metadata, MetadataBlockHeader,
    METADATA_BLOCK_HEADER_SIZE,
};
use crate::reader::LogicalReader;
use crate::source::{ByteSource, SourceWindow};

const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Settings for opening a volume.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Byte offset of the BitLocker volume inside the source, for partitions
    /// inside a disk image.
    pub volume_offset: u64,
    /// Number of decrypted sectors kept in memory.
    pub cache_capacity: NonZeroUsize,
    /// Raised by the caller to interrupt password stretching or the
    /// metadata scan.
    pub abort: AbortSignal,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        VolumeOptions {
            volume_offset: 0,
            cache_capacity: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            abort: AbortSignal::new(),
        }
    }
}

/// An opened BitLocker volume.
///
/// Opening succeeds as soon as a metadata copy parses. If none of the
/// credentials unlocks the volume it stays locked: metadata queries work,
/// reads fail with `KeyError::KeysNotSet` until `unlock` succeeds.
pub struct Volume<S> {
    source: SourceWindow<S>,
    header: VolumeHeader,
    metadata: Metadata,
    context: EncryptionContext,
    reader: LogicalReader,
    abort: AbortSignal,
}

impl<S: ByteSource> Volume<S> {
    /// Open a volume with default options.
    pub fn open(source: S, credentials: &[Credential]) -> Result<Self> {
        Self::open_with_options(source, credentials, VolumeOptions::default())
    }

    pub fn open_with_options(
        source: S,
        credentials: &[Credential],
        options: VolumeOptions,
    ) -> Result<Self> {
        let mut source = SourceWindow::new(source, options.volume_offset);
        let abort = options.abort;

        let boot = BootSector::read(&mut source)?;
        log::info!(
            "BitLocker volume format version {} ({:?}), {} bytes per sector",
            boot.version.number(),
            boot.version,
            boot.bytes_per_sector
        );

        let source_size = source.size()?;
        let (header, metadata) = read_metadata(&mut source, &boot, source_size, &abort)?;
        let reader = LogicalReader::new(&header, options.cache_capacity)?;

        let mut volume = Volume {
            source,
            header,
            metadata,
            context: EncryptionContext::default(),
            reader,
            abort,
        };

        match volume.unlock(credentials) {
            Ok(()) => {}
            Err(err) if err.is_key_failure() => {
                log::warn!("Volume remains locked: {}", err);
            }
            Err(err) => return Err(err),
        }
        Ok(volume)
    }

    /// Try to unlock a locked volume with more credentials.
    ///
    /// The volume only becomes unlocked when the whole key chain resolves
    /// (and, on Vista, the boot sector has been captured); on failure it
    /// stays locked.
    pub fn unlock(&mut self, credentials: &[Credential]) -> Result<()> {
        if self.context.is_keyed() {
            return Ok(());
        }

        let material = resolve_keys(&self.metadata, credentials, &self.abort)?;
        let context = EncryptionContext::new(&material)?;
        if let Some(volume_header) = self.header.read_unencrypted_volume_header(&mut self.source)? {
            self.reader.set_volume_header(volume_header)?;
        }
        self.context = context;

        log::info!("Volume unlocked, encryption method {}", material.method);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        !self.context.is_keyed()
    }

    /// Read at the current offset, advancing it by the number of bytes read.
    ///
    /// Returns 0 at the end of the volume.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(&mut self.source, &self.context, buf)
    }

    /// Read at `offset` without moving the current offset.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reader.read_at(&mut self.source, &self.context, offset, buf)
    }

    pub fn seek_offset(&mut self, pos: SeekFrom) -> Result<u64> {
        self.reader.seek(pos)
    }

    /// Current read offset.
    pub fn offset(&self) -> u64 {
        self.reader.position()
    }

    /// Size of the decrypted volume in bytes.
    pub fn size(&self) -> u64 {
        self.reader.volume_size()
    }

    /// Creation time as a FILETIME (100 ns intervals since 1601-01-01).
    pub fn creation_time(&self) -> u64 {
        self.metadata.creation_time
    }

    pub fn creation_time_as_system_time(&self) -> SystemTime {
        filetime_to_system_time(self.metadata.creation_time)
    }

    pub fn volume_identifier(&self) -> Uuid {
        self.metadata.volume_identifier
    }

    pub fn description(&self) -> Option<&str> {
        self.metadata.description.as_deref()
    }

    pub fn encryption_method(&self) -> EncryptionMethod {
        self.metadata.encryption_method
    }

    pub fn format_version(&self) -> FormatVersion {
        self.header.version
    }

    pub fn key_protector_count(&self) -> usize {
        self.metadata.volume_master_keys.len()
    }

    pub fn key_protector(&self, index: usize) -> Result<KeyProtector> {
        self.metadata
            .key_protectors()
            .nth(index)
            .ok_or_else(|| ArgumentError::IndexOutOfBounds.into())
    }

    pub fn key_protectors(&self) -> impl Iterator<Item = KeyProtector> + '_ {
        self.metadata.key_protectors()
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Interrupt a running or future `unlock`.
    pub fn signal_abort(&self) {
        self.abort.signal();
    }

    /// A handle to this volume's abort signal.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn into_inner(self) -> S {
        self.source.into_inner()
    }
}

// Candidate metadata offsets. Vista records only the first one in the boot
// sector; the block header found there lists all three.
fn metadata_offsets<S: ByteSource>(source: &mut SourceWindow<S>, boot: &BootSector) -> [u64; 3] {
    if boot.version != FormatVersion::Vista {
        return boot.metadata_offsets;
    }
    let first = boot.metadata_offsets[0];
    let mut data = [0u8; METADATA_BLOCK_HEADER_SIZE];
    let block_header = source
        .read_exact_at(first, &mut data)
        .map_err(Error::from)
        .and_then(|()| MetadataBlockHeader::parse(&data));
    match block_header {
        Ok(block_header) => block_header.metadata_offsets,
        Err(err) => {
            log::warn!("Unable to read metadata block header at 0x{:x}: {}", first, err);
            boot.metadata_offsets
        }
    }
}

// Accept the first metadata copy that parses. Copies are not compared
// against each other.
fn read_metadata<S: ByteSource>(
    source: &mut SourceWindow<S>,
    boot: &BootSector,
    source_size: u64,
    abort: &AbortSignal,
) -> Result<(VolumeHeader, Metadata)> {
    let mut last_error = None;

    for (index, &offset) in metadata_offsets(source, boot).iter().enumerate() {
        abort.check()?;
        if offset == 0 {
            continue;
        }
        let copy = Metadata::read(source, offset).and_then(|metadata| {
            let header = VolumeHeader::new(boot, &metadata.block_header, source_size)?;
            Ok((header, metadata))
        });
        match copy {
            Ok((header, metadata)) => {
                log::info!(
                    "Using metadata copy {} at offset 0x{:x} ({} key protectors)",
                    index + 1,
                    offset,
                    metadata.volume_master_keys.len()
                );
                return Ok((header, metadata));
            }
            Err(err) => {
                log::warn!("Metadata copy {} at offset 0x{:x} rejected: {}", index + 1, offset, err);
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| FormatError::Invalid("no metadata offsets").into()))
}

impl<S: ByteSource> Read for Volume<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.read_buffer(buf)?)
    }
}

impl<S: ByteSource> Seek for Volume<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_offset(pos)?)
    }
}
