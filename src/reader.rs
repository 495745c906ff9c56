// Sector-addressed logical reader: decrypts or substitutes whole sectors
// and keeps recently used plaintext sectors in an LRU cache.
use std::io::SeekFrom;
use std::num::NonZeroUsize;

use lru::LruCache;
use zeroize::Zeroize;

use crate::crypto::EncryptionContext;
use crate::error::{ArgumentError, FormatError, KeyError, Result};
use crate::header::{VersionSpecific, VolumeHeader};
use crate::source::{ByteSource, SourceWindow};

// What a substituted byte range reads as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    // The restored Vista boot sector captured at unlock.
    VolumeHeader,
    // Encrypted sectors relocated to this physical offset, decrypted with
    // their physical sector numbers.
    Relocated(u64),
    Zeros,
}

#[derive(Debug, Clone, Copy)]
struct Substitution {
    start: u64,
    end: u64,
    fill: Fill,
}

impl Substitution {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        self.start <= start && end <= self.end
    }
}

pub(crate) struct LogicalReader {
    // Bytes per sector.
    sector_size: u64,
    // Logical size of the volume.
    volume_size: u64,
    // Sectors from here on are stored in the clear.
    encrypted_volume_size: u64,
    // Plaintext served at logical offset 0 for Vista volumes; empty
    // otherwise.
    volume_header: Vec<u8>,
    // Ranges not decrypted in place; later entries win where they overlap.
    substitutions: Vec<Substitution>,
    // Decrypted sectors by logical sector number.
    cache: LruCache<u64, Vec<u8>>,
    // Logical position of the cursor.
    position: u64,
}

impl Drop for LogicalReader {
    fn drop(&mut self) {
        for (_, sector) in self.cache.iter_mut() {
            sector.zeroize();
        }
        self.volume_header.zeroize();
    }
}

impl LogicalReader {
    /// Build the substitution table from the volume geometry. A Vista
    /// boot sector reads as zeros until `set_volume_header` is called.
    pub(crate) fn new(header: &VolumeHeader, capacity: NonZeroUsize) -> Result<Self> {
        let volume_header_size = header.volume_header_size();
        if volume_header_size > header.volume_size {
            return Err(FormatError::Invalid("volume header size").into());
        }
        let mut substitutions = Vec::new();

        for &offset in header.metadata_offsets.iter().filter(|&&offset| offset != 0) {
            substitutions.push(Substitution {
                start: offset,
                end: offset.saturating_add(header.metadata_size),
                fill: Fill::Zeros,
            });
        }

        let (captured_size, header_fill) = match header.version_specific {
            VersionSpecific::Seven { volume_header_offset, volume_header_size } => {
                substitutions.push(Substitution {
                    start: volume_header_offset,
                    end: volume_header_offset.saturating_add(volume_header_size),
                    fill: Fill::Zeros,
                });
                (0, Fill::Relocated(volume_header_offset))
            }
            // One sector, bounded by the 16-bit sector size.
            VersionSpecific::Vista { .. } => (volume_header_size as usize, Fill::VolumeHeader),
        };
        substitutions.push(Substitution { start: 0, end: volume_header_size, fill: header_fill });

        for substitution in &substitutions {
            log::debug!(
                "Substituting 0x{:x}..0x{:x} with {:?}",
                substitution.start,
                substitution.end,
                substitution.fill
            );
        }

        Ok(Self {
            sector_size: header.bytes_per_sector as u64,
            volume_size: header.volume_size,
            encrypted_volume_size: header.encrypted_volume_size,
            volume_header: vec![0u8; captured_size],
            substitutions,
            cache: LruCache::new(capacity),
            position: 0,
        })
    }

    /// Install the restored Vista boot sector captured at unlock time.
    /// Cached sectors are dropped.
    pub(crate) fn set_volume_header(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() != self.volume_header.len() {
            return Err(FormatError::Invalid("volume header size").into());
        }
        self.volume_header.zeroize();
        self.volume_header = data;
        for (_, sector) in self.cache.iter_mut() {
            sector.zeroize();
        }
        self.cache.clear();
        Ok(())
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn volume_size(&self) -> u64 {
        self.volume_size
    }

    /// Move the cursor. Targets before the start or past the end of the
    /// volume fail with `InvalidSeek` and leave the cursor where it was.
    pub(crate) fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => (0i128, offset as i128),
            SeekFrom::Current(delta) => (self.position as i128, delta as i128),
            SeekFrom::End(delta) => (self.volume_size as i128, delta as i128),
        };
        let target = base + delta;
        if target < 0 || target > self.volume_size as i128 {
            return Err(ArgumentError::InvalidSeek.into());
        }
        self.position = target as u64;
        Ok(self.position)
    }

    /// Read at the cursor and advance it by the number of bytes read.
    pub(crate) fn read<S: ByteSource>(
        &mut self,
        source: &mut SourceWindow<S>,
        context: &EncryptionContext,
        buf: &mut [u8],
    ) -> Result<usize> {
        let read = self.read_at(source, context, self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }

    /// Read at `offset` without touching the cursor. Returns 0 at or past the
    /// end of the volume.
    pub(crate) fn read_at<S: ByteSource>(
        &mut self,
        source: &mut SourceWindow<S>,
        context: &EncryptionContext,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Err(ArgumentError::ZeroLengthBuffer.into());
        }
        if !context.is_keyed() {
            return Err(KeyError::KeysNotSet.into());
        }
        if offset >= self.volume_size {
            return Ok(0);
        }

        let length = buf.len().min((self.volume_size - offset) as usize);
        let mut done = 0;
        while done < length {
            let current = offset + done as u64;
            let sector_number = current / self.sector_size;
            let offset_in_sector = (current % self.sector_size) as usize;

            let sector = self.sector(source, context, sector_number)?;
            let count = (sector.len() - offset_in_sector).min(length - done);
            buf[done..done + count]
                .copy_from_slice(&sector[offset_in_sector..offset_in_sector + count]);
            done += count;
        }
        Ok(done)
    }

    // Plaintext of one logical sector, through the cache.
    fn sector<S: ByteSource>(
        &mut self,
        source: &mut SourceWindow<S>,
        context: &EncryptionContext,
        sector_number: u64,
    ) -> Result<&[u8]> {
        if !self.cache.contains(&sector_number) {
            let data = self.load_sector(source, context, sector_number)?;
            if let Some((evicted, mut old)) = self.cache.push(sector_number, data) {
                if evicted != sector_number {
                    log::debug!("Evicted sector {} from cache", evicted);
                }
                old.zeroize();
            }
        }
        self.cache
            .get(&sector_number)
            .map(Vec::as_slice)
            .ok_or_else(|| FormatError::Invalid("sector cache").into())
    }

    fn load_sector<S: ByteSource>(
        &self,
        source: &mut SourceWindow<S>,
        context: &EncryptionContext,
        sector_number: u64,
    ) -> Result<Vec<u8>> {
        let start = sector_number
            .checked_mul(self.sector_size)
            .ok_or(FormatError::SizeOutOfBounds)?;
        let end = start + self.sector_size;
        let mut data = vec![0u8; self.sector_size as usize];

        let covered = self.substitutions.iter().any(|s| s.covers(start, end));
        if !covered {
            log::trace!("Loading sector {}", sector_number);
            source.read_exact_at(start, &mut data)?;
            // Past the encrypted size the volume is still stored in the clear.
            if start < self.encrypted_volume_size {
                context.decrypt_sector(sector_number, &mut data)?;
            }
        }

        for substitution in self.substitutions.iter().filter(|s| s.overlaps(start, end)) {
            let from = substitution.start.max(start);
            let to = substitution.end.min(end);
            let target = &mut data[(from - start) as usize..(to - start) as usize];
            match substitution.fill {
                Fill::Zeros => target.fill(0),
                Fill::Relocated(physical_offset) => {
                    // Sector aligned by construction, so `target` is whole
                    // sectors.
                    let physical_start = physical_offset
                        .checked_add(from - substitution.start)
                        .ok_or(FormatError::SizeOutOfBounds)?;
                    log::trace!(
                        "Loading sector {} from volume header at 0x{:x}",
                        sector_number,
                        physical_start
                    );
                    source.read_exact_at(physical_start, target)?;
                    context.decrypt_sector(physical_start / self.sector_size, target)?;
                }
                Fill::VolumeHeader => {
                    let header_start = (from - substitution.start) as usize;
                    target.copy_from_slice(
                        &self.volume_header[header_start..header_start + target.len()],
                    );
                }
            }
        }
        Ok(data)
    }
}
