//! zkv-custody: custodial delegation
//!
//! A custodian periodically re-signs and republishes an owner's records so
//! they stay resolvable while the owner is offline. The owner wraps each
//! record-signing key to the custodian's current epoch key; the custodian
//! opens it only for the duration of one republish.
//!
//! - `epoch`: append-only custodian key epochs with clock-computed states
//! - `enroll`: owner-side enrollment and re-wrapping
//! - `custodian`: epoch private keys and the re-sign/republish operation
//! - `scheduler`: one republish loop per enrolled entity

pub mod custodian;
pub mod enroll;
pub mod epoch;
pub mod scheduler;

pub use custodian::{Custodian, CustodianKeys, CustodianService};
pub use enroll::{enroll, load_enrollments, needs_rewrap, rewrap, save_enrollment, Enrollment};
pub use epoch::{CustodianEpoch, EpochId, EpochState, EpochTable};
pub use scheduler::{CycleOutcome, CycleReport, RepublishScheduler};
