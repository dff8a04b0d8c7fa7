//! zkv-devices: adding devices to a vault
//!
//! - `bulletin`: low-durability request/reply board for the handshake
//! - `authorize`: requester and approver sides of the handshake
//! - `registry`: encrypted, published device list with enforced transitions
//!
//! A new device never learns anything from the board alone: the reply is
//! wrapped to an ephemeral key only the requester holds.

pub mod authorize;
pub mod bulletin;
pub mod registry;

pub use authorize::{approve_request, GrantedAccess, PendingAuthorization};
pub use bulletin::{
    AuthorizationRequest, AuthorizationResponse, BulletinBoard, BulletinEntry,
    MemoryBulletinBoard, RequestStatus,
};
pub use registry::{is_authorized, status_of, DeviceInfo, DeviceRegistry, REGISTRY_KEY_DOMAIN};
