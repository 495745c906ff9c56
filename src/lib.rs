//! Read-only access to BitLocker Drive Encryption (BDE) volumes.
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::Read;
//!
//! use bdecrypt::{Credential, Volume};
//!
//! # fn main() -> bdecrypt::Result<()> {
//! let image = File::open("bitlocker.raw")?;
//! let mut volume = Volume::open(image, &[Credential::password("secret")])?;
//! if !volume.is_locked() {
//!     let mut boot_sector = [0u8; 512];
//!     volume.read_exact(&mut boot_sector)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The library only logs through the `log` facade; install a logger in the
//! embedding application to see it.

mod diffuser;
mod reader;
mod source;

pub mod crypto;
pub mod entry;
pub mod error;
pub mod header;
pub mod keys;
pub mod metadata;
pub mod volume;

pub use crypto::{EncryptionContext, EncryptionMethod};
pub use entry::{MetadataEntry, ProtectionType};
pub use error::{ArgumentError, CryptoError, Error, FormatError, KeyError, Result};
pub use header::{BootSector, FormatVersion, VolumeHeader};
pub use keys::{AbortSignal, Credential, ResolvedKeyMaterial, StartupKey};
pub use metadata::{KeyProtector, Metadata};
pub use source::ByteSource;
pub use volume::{Volume, VolumeOptions};
