//! zkv-records: the metadata record engine
//!
//! Folder, file-pointer and device-registry records are JSON bodies tagged
//! with an explicit schema version, sealed under the entity's key. Decoding
//! upgrades known older versions in place and rejects unknown ones.

pub mod codec;
pub mod record;
pub mod sequence;

pub use codec::{decode_record, encode_record, RecordBody, RecordKind};
pub use record::{
    ChildEntry, ContentVersion, DeviceRecord, DeviceRegistryRecord, DeviceStatus, EntryKind,
    FilePointer, FolderRecord,
};
pub use sequence::{Freshness, Sequence, SequenceTracker, MAX_SAFE_SEQUENCE};
