//! PDR cache core -- AIP identifiers, checksums, metadata envelope, clock.
//!
//! Foundation layer for the PDR content cache, with no I/O of its own:
//!
//! - **Identifiers** ([`id`]): the `dsid[/filepath][#version]` AIP grammar
//! - **Checksums** ([`checksum`]): SHA-256 digests for restore and integrity
//! - **Metadata** ([`metadata`]): the verbatim JSON blob with lifted keys
//! - **Clock** ([`clock`]): injectable epoch-ms time source

pub mod checksum;
pub mod clock;
pub mod id;
pub mod metadata;

// Identifiers
pub use id::{AipId, IdError};

// Checksums
pub use checksum::{sha256_hex, Checksum, Sha256Digest, SHA256};

// Metadata
pub use metadata::ObjectMetadata;

// Clock
pub use clock::{iso8601_utc, utc_midnight, ClockSource, ManualClock, SystemClock, MILLIS_PER_DAY};
