pub mod config;
pub mod error;
pub mod types;

pub use error::{ConflictRecord, VaultError, VaultResult};
pub use types::{Clock, DeviceId, EntityId, ManualClock, SystemClock};
