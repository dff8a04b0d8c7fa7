//! Device authorization handshake.
//!
//! Requester (new device):
//! 1. [`PendingAuthorization::begin`] generates an ephemeral X25519 keypair
//!    and posts only its public half.
//! 2. [`PendingAuthorization::poll`] waits for the reply.
//! 3. [`PendingAuthorization::complete`] unwraps the factor, opens the
//!    sealed identity and hands back vault access.
//!
//! Approver (authorized device): [`approve_request`] wraps a fresh factor to
//! the ephemeral key and seals the identity seed under it.
//!
//! The ephemeral secret and the factor are zeroized as soon as they are
//! used, on every path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;
use zkv_core::config::DevicesConfig;
use zkv_core::{Clock, DeviceId, EntityId, VaultError, VaultResult};
use zkv_crypto::{
    aead, generate_symmetric_key, unwrap_key, wrap_key, IdentityKeypair, KeyKind, SymmetricKey,
    VaultHeader, WrapSecretKey,
};
use zkv_records::DeviceRegistryRecord;

use crate::bulletin::{AuthorizationRequest, AuthorizationResponse, BulletinBoard, RequestStatus};
use crate::registry::{is_authorized, DeviceInfo};

fn access_aad(request_id: &str) -> Vec<u8> {
    format!("zkv-device-access-v1:{request_id}").into_bytes()
}

/// What a newly authorized device walks away with.
pub struct GrantedAccess {
    pub identity: IdentityKeypair,
    pub header: VaultHeader,
    pub approved_by: DeviceId,
}

impl std::fmt::Debug for GrantedAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrantedAccess")
            .field("vault", &self.header.vault_id)
            .field("approved_by", &self.approved_by)
            .finish_non_exhaustive()
    }
}

pub struct PendingAuthorization {
    request: AuthorizationRequest,
    ephemeral: Option<WrapSecretKey>,
    board: Arc<dyn BulletinBoard>,
    poll_interval: Duration,
}

impl PendingAuthorization {
    /// Post a new authorization request for `device` to join `vault_id`.
    pub async fn begin(
        board: Arc<dyn BulletinBoard>,
        device: &DeviceInfo,
        vault_id: EntityId,
        config: &DevicesConfig,
        clock: &dyn Clock,
    ) -> VaultResult<Self> {
        let ephemeral = WrapSecretKey::generate();
        let now = clock.now();
        let request = AuthorizationRequest {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device.device_id.clone(),
            device_name: device.name.clone(),
            platform: device.platform.clone(),
            ephemeral_public_key: ephemeral.public(),
            vault_id,
            created_at: now,
            expires_at: now.saturating_add(config.request_ttl_secs),
        };
        board.post(request.clone()).await?;

        info!(request = %request.id, device = %device.device_id, "authorization requested");
        Ok(Self {
            request,
            ephemeral: Some(ephemeral),
            board,
            poll_interval: config.poll_interval(),
        })
    }

    pub fn request(&self) -> &AuthorizationRequest {
        &self.request
    }

    /// Wait up to `timeout` for the request to be fulfilled.
    ///
    /// `Ok(None)` means still pending when the timeout elapsed; terminal
    /// states surface as `RequestExpired` / `RequestCancelled`.
    pub async fn poll(&self, timeout: Duration) -> VaultResult<Option<AuthorizationResponse>> {
        match tokio::time::timeout(timeout, self.wait_for_reply()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                debug!(request = %self.request.id, ?timeout, "authorization still pending");
                Ok(None)
            }
        }
    }

    async fn wait_for_reply(&self) -> VaultResult<AuthorizationResponse> {
        let id = &self.request.id;
        loop {
            match self.board.get(id).await?.status {
                RequestStatus::Pending => tokio::time::sleep(self.poll_interval).await,
                RequestStatus::Fulfilled(response) => return Ok(*response),
                RequestStatus::Expired => return Err(VaultError::RequestExpired(id.clone())),
                RequestStatus::Cancelled => return Err(VaultError::RequestCancelled(id.clone())),
            }
        }
    }

    /// Open the reply and reconstruct vault access. Consumes the request;
    /// the ephemeral secret is dropped whether or not this succeeds.
    pub fn complete(mut self, response: AuthorizationResponse) -> VaultResult<GrantedAccess> {
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| VaultError::InvalidTransition("authorization already completed".into()))?;

        if response.request_id != self.request.id {
            return Err(VaultError::UnwrapFailed(format!(
                "reply is for request {}, not {}",
                response.request_id, self.request.id
            )));
        }
        if response.header.vault_id != self.request.vault_id {
            return Err(VaultError::UnwrapFailed(format!(
                "reply is for vault {}, requested {}",
                response.header.vault_id, self.request.vault_id
            )));
        }

        let factor = unwrap_key(&response.wrapped_factor, &ephemeral, KeyKind::Factor)?;
        drop(ephemeral);
        let factor = SymmetricKey::from_bytes(*factor);

        let seed = aead::open(&factor, &response.sealed_access, &access_aad(&self.request.id))?;
        drop(factor);
        let identity = IdentityKeypair::from_seed_slice(&seed)?;
        drop(seed);

        if identity.public() != response.header.owner {
            return Err(VaultError::UnwrapFailed(
                "recovered identity does not own the vault".into(),
            ));
        }

        info!(request = %self.request.id, approver = %response.approver, "authorization complete");
        Ok(GrantedAccess {
            identity,
            header: response.header,
            approved_by: response.approver,
        })
    }

    /// Withdraw the request.
    pub async fn cancel(mut self) -> VaultResult<()> {
        self.ephemeral.take();
        self.board.cancel(&self.request.id).await
    }
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        if self.ephemeral.is_some() {
            debug!(request = %self.request.id, "pending authorization dropped");
        }
    }
}

/// Approve `request_id` from an authorized device holding the vault identity.
///
/// Self-fulfillment is rejected before any other check.
pub async fn approve_request(
    board: &dyn BulletinBoard,
    request_id: &str,
    approver: &DeviceId,
    registry: &DeviceRegistryRecord,
    identity: &IdentityKeypair,
    header: &VaultHeader,
    clock: &dyn Clock,
) -> VaultResult<()> {
    let entry = board.get(request_id).await?;
    let request = entry.request;

    if request.device_id == *approver {
        warn!(request = %request_id, device = %approver, "device attempted to approve its own request");
        return Err(VaultError::SelfFulfillment(approver.to_string()));
    }
    match entry.status {
        RequestStatus::Pending => {}
        RequestStatus::Fulfilled(_) => {
            return Err(VaultError::RequestAlreadyFulfilled(request_id.to_string()))
        }
        RequestStatus::Expired => return Err(VaultError::RequestExpired(request_id.to_string())),
        RequestStatus::Cancelled => {
            return Err(VaultError::RequestCancelled(request_id.to_string()))
        }
    }
    if !is_authorized(registry, approver) {
        return Err(VaultError::Unauthorized(format!(
            "device {approver} is not authorized in this vault"
        )));
    }
    if request.vault_id != header.vault_id || identity.public() != header.owner {
        return Err(VaultError::Unauthorized(format!(
            "request {request_id} is not for this vault"
        )));
    }

    let factor = generate_symmetric_key();
    let wrapped_factor = wrap_key(factor.as_bytes(), KeyKind::Factor, &request.ephemeral_public_key)?;
    let seed: Zeroizing<[u8; 32]> = identity.seed();
    let sealed_access = aead::seal(&factor, &seed[..], &access_aad(request_id))?;
    drop(seed);
    drop(factor);

    board
        .fulfill(AuthorizationResponse {
            request_id: request_id.to_string(),
            approver: approver.clone(),
            wrapped_factor,
            sealed_access,
            header: header.clone(),
            fulfilled_at: clock.now(),
        })
        .await?;
    info!(request = %request_id, device = %request.device_id, name = %request.device_name, "authorization approved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulletin::MemoryBulletinBoard;
    use crate::registry::authorize;
    use zkv_core::ManualClock;

    struct Setup {
        clock: Arc<ManualClock>,
        board: Arc<MemoryBulletinBoard>,
        identity: IdentityKeypair,
        header: VaultHeader,
        registry: DeviceRegistryRecord,
        config: DevicesConfig,
    }

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::from(id),
            name: id.into(),
            platform: "linux".into(),
            public_key: WrapSecretKey::generate().public(),
        }
    }

    fn setup() -> Setup {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = DevicesConfig::default();
        let board = Arc::new(MemoryBulletinBoard::new(clock.clone(), config.max_pending_requests));
        let identity = IdentityKeypair::generate();
        let (header, _) = VaultHeader::create(&identity, 1_000).unwrap();
        let mut registry = DeviceRegistryRecord {
            vault_id: header.vault_id,
            owner: identity.public(),
            devices: Vec::new(),
            updated_at: 1_000,
        };
        authorize(&mut registry, device("laptop"), None, 1_000).unwrap();
        Setup {
            clock,
            board,
            identity,
            header,
            registry,
            config,
        }
    }

    async fn begin(s: &Setup, id: &str) -> PendingAuthorization {
        PendingAuthorization::begin(
            s.board.clone(),
            &device(id),
            s.header.vault_id,
            &s.config,
            s.clock.as_ref(),
        )
        .await
        .unwrap()
    }

    async fn approve(s: &Setup, request_id: &str, approver: &str) -> VaultResult<()> {
        approve_request(
            s.board.as_ref(),
            request_id,
            &DeviceId::from(approver),
            &s.registry,
            &s.identity,
            &s.header,
            s.clock.as_ref(),
        )
        .await
    }

    #[tokio::test]
    async fn test_handshake_transfers_identity() {
        let s = setup();
        let pending = begin(&s, "phone").await;
        let id = pending.request().id.clone();

        assert!(pending.poll(Duration::ZERO).await.unwrap().is_none());
        approve(&s, &id, "laptop").await.unwrap();

        let response = pending.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        let access = pending.complete(response).unwrap();
        assert_eq!(access.identity.public(), s.identity.public());
        assert_eq!(access.header, s.header);
        assert_eq!(access.approved_by, DeviceId::from("laptop"));
    }

    #[tokio::test]
    async fn test_self_approval_rejected() {
        let s = setup();
        let pending = begin(&s, "laptop").await;
        assert!(matches!(
            approve(&s, &pending.request().id, "laptop").await,
            Err(VaultError::SelfFulfillment(_))
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_approver_rejected() {
        let s = setup();
        let pending = begin(&s, "phone").await;
        assert!(matches!(
            approve(&s, &pending.request().id, "tablet").await,
            Err(VaultError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_request() {
        let s = setup();
        let pending = begin(&s, "phone").await;
        s.clock.advance(s.config.request_ttl_secs);

        assert!(matches!(
            approve(&s, &pending.request().id, "laptop").await,
            Err(VaultError::RequestExpired(_))
        ));
        assert!(matches!(
            pending.poll(Duration::from_secs(1)).await,
            Err(VaultError::RequestExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let s = setup();
        let pending = begin(&s, "phone").await;
        let id = pending.request().id.clone();
        pending.cancel().await.unwrap();

        assert!(matches!(
            approve(&s, &id, "laptop").await,
            Err(VaultError::RequestCancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_for_other_request_rejected() {
        let s = setup();
        let first = begin(&s, "phone").await;
        let second = begin(&s, "tablet").await;
        approve(&s, &first.request().id, "laptop").await.unwrap();

        let response = first.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(matches!(
            second.complete(response),
            Err(VaultError::UnwrapFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sees_late_fulfillment() {
        let s = setup();
        let pending = begin(&s, "phone").await;
        let id = pending.request().id.clone();

        let board = s.board.clone();
        let approver = tokio::spawn({
            let registry = s.registry.clone();
            let identity = s.identity.clone();
            let header = s.header.clone();
            let clock = s.clock.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(7)).await;
                approve_request(
                    board.as_ref(),
                    &id,
                    &DeviceId::from("laptop"),
                    &registry,
                    &identity,
                    &header,
                    clock.as_ref(),
                )
                .await
            }
        });

        let response = pending.poll(Duration::from_secs(60)).await.unwrap();
        approver.await.unwrap().unwrap();
        assert!(response.is_some());
    }
}
