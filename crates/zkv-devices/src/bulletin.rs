//! Bulletin board for the device authorization handshake.
//!
//! A low-durability store keyed by request id. The requester posts an
//! ephemeral public key; an authorized device later attaches a reply
//! encrypted to it. Neither side needs to be online at the same time, and
//! the board never sees anything it could decrypt.
//!
//! TTL is enforced by the board: an expired request reads as `Expired` and
//! can no longer be fulfilled, whether or not it has been swept yet.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zkv_core::{Clock, DeviceId, EntityId, VaultError, VaultResult};
use zkv_crypto::{VaultHeader, WrapPublicKey, WrappedKeyEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub id: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: String,
    pub ephemeral_public_key: WrapPublicKey,
    pub vault_id: EntityId,
    pub created_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub request_id: String,
    pub approver: DeviceId,
    /// Fresh factor wrapped to the request's ephemeral key
    pub wrapped_factor: WrappedKeyEnvelope,
    /// Identity seed sealed under the factor
    #[serde(with = "zkv_crypto::encoding::base64_bytes")]
    pub sealed_access: Vec<u8>,
    /// Public vault header the new device opens with the recovered identity
    pub header: VaultHeader,
    pub fulfilled_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Fulfilled(Box<AuthorizationResponse>),
    Expired,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BulletinEntry {
    pub request: AuthorizationRequest,
    pub status: RequestStatus,
}

#[async_trait]
pub trait BulletinBoard: Send + Sync {
    async fn post(&self, request: AuthorizationRequest) -> VaultResult<()>;
    async fn get(&self, request_id: &str) -> VaultResult<BulletinEntry>;
    async fn fulfill(&self, response: AuthorizationResponse) -> VaultResult<()>;
    async fn cancel(&self, request_id: &str) -> VaultResult<()>;
    /// Drop expired and cancelled entries. Returns how many were removed.
    async fn sweep_expired(&self) -> VaultResult<usize>;
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Fulfilled(Box<AuthorizationResponse>),
    Cancelled,
}

pub struct MemoryBulletinBoard {
    entries: Mutex<HashMap<String, (AuthorizationRequest, Slot)>>,
    clock: Arc<dyn Clock>,
    max_pending: usize,
}

impl MemoryBulletinBoard {
    pub fn new(clock: Arc<dyn Clock>, max_pending: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            max_pending,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn status_of(request: &AuthorizationRequest, slot: &Slot, now: u64) -> RequestStatus {
    match slot {
        Slot::Cancelled => RequestStatus::Cancelled,
        Slot::Fulfilled(response) => RequestStatus::Fulfilled(response.clone()),
        Slot::Pending if now >= request.expires_at => RequestStatus::Expired,
        Slot::Pending => RequestStatus::Pending,
    }
}

#[async_trait]
impl BulletinBoard for MemoryBulletinBoard {
    async fn post(&self, request: AuthorizationRequest) -> VaultResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if entries.contains_key(&request.id) {
            return Err(VaultError::InvalidTransition(format!(
                "request {} already posted",
                request.id
            )));
        }
        let pending = entries
            .values()
            .filter(|(r, slot)| status_of(r, slot, now) == RequestStatus::Pending)
            .count();
        if pending >= self.max_pending {
            return Err(VaultError::TooManyPendingRequests(self.max_pending));
        }

        info!(request = %request.id, device = %request.device_id, expires_at = request.expires_at, "authorization request posted");
        entries.insert(request.id.clone(), (request, Slot::Pending));
        Ok(())
    }

    async fn get(&self, request_id: &str) -> VaultResult<BulletinEntry> {
        let now = self.clock.now();
        self.entries
            .lock()
            .get(request_id)
            .map(|(request, slot)| BulletinEntry {
                request: request.clone(),
                status: status_of(request, slot, now),
            })
            .ok_or_else(|| VaultError::NotFound(format!("authorization request {request_id}")))
    }

    async fn fulfill(&self, response: AuthorizationResponse) -> VaultResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let id = response.request_id.clone();
        let (request, slot) = entries
            .get_mut(&id)
            .ok_or_else(|| VaultError::NotFound(format!("authorization request {id}")))?;

        if response.approver == request.device_id {
            return Err(VaultError::SelfFulfillment(request.device_id.to_string()));
        }
        match status_of(request, slot, now) {
            RequestStatus::Pending => {}
            RequestStatus::Fulfilled(_) => return Err(VaultError::RequestAlreadyFulfilled(id)),
            RequestStatus::Expired => return Err(VaultError::RequestExpired(id)),
            RequestStatus::Cancelled => return Err(VaultError::RequestCancelled(id)),
        }

        info!(request = %id, approver = %response.approver, "authorization request fulfilled");
        *slot = Slot::Fulfilled(Box::new(response));
        Ok(())
    }

    async fn cancel(&self, request_id: &str) -> VaultResult<()> {
        let mut entries = self.entries.lock();
        let (_, slot) = entries
            .get_mut(request_id)
            .ok_or_else(|| VaultError::NotFound(format!("authorization request {request_id}")))?;
        // A fulfilled reply is discarded too.
        *slot = Slot::Cancelled;
        debug!(request = %request_id, "authorization request cancelled");
        Ok(())
    }

    async fn sweep_expired(&self) -> VaultResult<usize> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (request, slot)| {
            !matches!(slot, Slot::Cancelled) && now < request.expires_at
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "bulletin board swept");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkv_core::ManualClock;
    use zkv_crypto::{wrap_key, IdentityKeypair, KeyKind, WrapSecretKey};

    fn request(device: &str, now: u64, ttl: u64) -> AuthorizationRequest {
        AuthorizationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: DeviceId::from(device),
            device_name: "laptop".into(),
            platform: "linux".into(),
            ephemeral_public_key: WrapSecretKey::generate().public(),
            vault_id: EntityId::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    fn response(request: &AuthorizationRequest, approver: &str) -> AuthorizationResponse {
        let identity = IdentityKeypair::generate();
        let (header, _) = VaultHeader::create(&identity, 0).unwrap();
        AuthorizationResponse {
            request_id: request.id.clone(),
            approver: DeviceId::from(approver),
            wrapped_factor: wrap_key(&[7u8; 32], KeyKind::Factor, &request.ephemeral_public_key)
                .unwrap(),
            sealed_access: vec![1, 2, 3],
            header,
            fulfilled_at: 0,
        }
    }

    fn board(clock: &Arc<ManualClock>, max: usize) -> MemoryBulletinBoard {
        MemoryBulletinBoard::new(clock.clone(), max)
    }

    #[tokio::test]
    async fn test_pending_then_fulfilled() {
        let clock = Arc::new(ManualClock::new(100));
        let board = board(&clock, 5);
        let req = request("new-phone", 100, 600);
        board.post(req.clone()).await.unwrap();
        assert_eq!(board.get(&req.id).await.unwrap().status, RequestStatus::Pending);

        board.fulfill(response(&req, "laptop")).await.unwrap();
        assert!(matches!(
            board.get(&req.id).await.unwrap().status,
            RequestStatus::Fulfilled(_)
        ));
        assert!(matches!(
            board.fulfill(response(&req, "desktop")).await,
            Err(VaultError::RequestAlreadyFulfilled(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_enforced_without_sweep() {
        let clock = Arc::new(ManualClock::new(100));
        let board = board(&clock, 5);
        let req = request("new-phone", 100, 600);
        board.post(req.clone()).await.unwrap();

        clock.advance(600);
        assert_eq!(board.get(&req.id).await.unwrap().status, RequestStatus::Expired);
        assert!(matches!(
            board.fulfill(response(&req, "laptop")).await,
            Err(VaultError::RequestExpired(_))
        ));

        assert_eq!(board.sweep_expired().await.unwrap(), 1);
        assert!(matches!(board.get(&req.id).await, Err(VaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_self_fulfillment_rejected_before_state() {
        let clock = Arc::new(ManualClock::new(100));
        let board = board(&clock, 5);
        let req = request("new-phone", 100, 600);
        board.post(req.clone()).await.unwrap();
        clock.advance(1_000);

        // Expired too, but self-fulfillment is reported first.
        assert!(matches!(
            board.fulfill(response(&req, "new-phone")).await,
            Err(VaultError::SelfFulfillment(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_reply() {
        let clock = Arc::new(ManualClock::new(100));
        let board = board(&clock, 5);
        let req = request("new-phone", 100, 600);
        board.post(req.clone()).await.unwrap();
        board.fulfill(response(&req, "laptop")).await.unwrap();

        board.cancel(&req.id).await.unwrap();
        assert_eq!(board.get(&req.id).await.unwrap().status, RequestStatus::Cancelled);
        assert_eq!(board.sweep_expired().await.unwrap(), 1);
        assert!(board.is_empty());
    }

    #[tokio::test]
    async fn test_pending_cap() {
        let clock = Arc::new(ManualClock::new(100));
        let board = board(&clock, 2);
        board.post(request("a", 100, 60)).await.unwrap();
        board.post(request("b", 100, 600)).await.unwrap();
        assert!(matches!(
            board.post(request("c", 100, 600)).await,
            Err(VaultError::TooManyPendingRequests(2))
        ));

        // Expired requests no longer count against the cap.
        clock.advance(60);
        board.post(request("c", 160, 600)).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let board = board(&clock, 5);
        let req = request("a", 0, 60);
        board.post(req.clone()).await.unwrap();
        assert!(matches!(
            board.post(req).await,
            Err(VaultError::InvalidTransition(_))
        ));
    }
}
