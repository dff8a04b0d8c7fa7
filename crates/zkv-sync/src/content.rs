//! Content-addressed blob store
//!
//! Blobs are already sealed by the caller; the store never sees plaintext.
//! Addresses are `blake3:<hex>` of the stored bytes, so a read can be
//! checked against its address.

use async_trait::async_trait;
use opendal::Operator;
use tracing::debug;
use zkv_core::config::StorageConfig;
use zkv_core::{VaultError, VaultResult};

const ADDRESS_PREFIX: &str = "blake3:";

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> VaultResult<String>;
    async fn get(&self, address: &str) -> VaultResult<Vec<u8>>;
    async fn unpin(&self, address: &str) -> VaultResult<()>;
}

/// Build the opendal operator for the configured backend.
pub fn build_operator(config: &StorageConfig) -> VaultResult<Operator> {
    let op = match config.backend.as_str() {
        "memory" => Operator::new(opendal::services::Memory::default())
            .map_err(|e| VaultError::Config(format!("creating memory operator: {e}")))?
            .finish(),
        "fs" => {
            let root = config.root.to_string_lossy().to_string();
            Operator::new(opendal::services::Fs::default().root(&root))
                .map_err(|e| VaultError::Config(format!("creating fs operator at {root}: {e}")))?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(opendal::layers::RetryLayer::new().with_max_times(3).with_jitter())
                .finish()
        }
        other => {
            return Err(VaultError::Config(format!(
                "unknown storage backend '{other}' (expected \"memory\" or \"fs\")"
            )))
        }
    };
    Ok(op)
}

pub struct OpendalContentStore {
    op: Operator,
    prefix: String,
}

impl OpendalContentStore {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn path(&self, address: &str) -> VaultResult<String> {
        let hex = address
            .strip_prefix(ADDRESS_PREFIX)
            .filter(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| VaultError::NotFound(format!("invalid content address: {address}")))?;
        Ok(format!("{}/content/{}/{}", self.prefix, &hex[..2], hex))
    }
}

pub fn content_address(bytes: &[u8]) -> String {
    format!("{ADDRESS_PREFIX}{}", blake3::hash(bytes).to_hex())
}

#[async_trait]
impl ContentStore for OpendalContentStore {
    async fn put(&self, bytes: Vec<u8>) -> VaultResult<String> {
        let address = content_address(&bytes);
        let path = self.path(&address)?;
        let size = bytes.len();
        self.op
            .write(&path, bytes)
            .await
            .map_err(|e| VaultError::Other(anyhow::anyhow!("uploading {address}: {e}")))?;
        debug!(%address, size, "content stored");
        Ok(address)
    }

    async fn get(&self, address: &str) -> VaultResult<Vec<u8>> {
        let path = self.path(address)?;
        let bytes = match self.op.read(&path).await {
            Ok(buf) => buf.to_vec(),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(format!("content {address}")))
            }
            Err(e) => {
                return Err(VaultError::Other(anyhow::anyhow!(
                    "downloading {address}: {e}"
                )))
            }
        };

        if content_address(&bytes) != address {
            return Err(VaultError::DecryptionFailed(format!(
                "content integrity check failed for {address}"
            )));
        }
        Ok(bytes)
    }

    async fn unpin(&self, address: &str) -> VaultResult<()> {
        let path = self.path(address)?;
        self.op
            .delete(&path)
            .await
            .map_err(|e| VaultError::Other(anyhow::anyhow!("unpinning {address}: {e}")))?;
        debug!(%address, "content unpinned");
        Ok(())
    }
}
