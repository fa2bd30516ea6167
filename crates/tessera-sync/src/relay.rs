//! Relay request handling.
//!
//! The relay never sees plaintext. Per request it checks the tenant, stores
//! whatever the client sent, compares trees and answers with the messages
//! the client is missing:
//!
//! ```text
//! policy -> decode/version -> owner match -> write key -> store
//!        -> diff(relay tree, client tree) -> response
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{diff, OwnerId};
use tessera_store::{RelayStore, StoreError};
use tracing::{debug, warn};

use crate::codec;
use crate::error::ProtocolDecodeError;
use crate::messages::{limits, Envelope, ErrorCode, SyncRequest, SyncResponse};
use crate::transport::FrameHandler;

/// Stateless request handler over a [`RelayStore`].
pub struct Relay<R> {
    store: Arc<R>,
}

impl<R> Clone for Relay<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

fn error_frame(owner: &OwnerId, code: ErrorCode) -> Vec<u8> {
    codec::encode(&Envelope::Error {
        owner: *owner,
        code,
    })
}

fn storage_failure(owner: &OwnerId, err: StoreError) -> ErrorCode {
    warn!(%owner, error = %err, "relay storage failure");
    ErrorCode::StorageFailure
}

impl<R: RelayStore> Relay<R> {
    pub fn new(store: Arc<R>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    /// Handle one frame on a connection opened for `owner`.
    ///
    /// Rejections the client can act on come back as error frames.
    /// A frame that cannot be decoded is an `Err`; the caller drops the
    /// connection.
    pub async fn handle(
        &self,
        owner: &OwnerId,
        frame: &[u8],
    ) -> Result<Vec<u8>, ProtocolDecodeError> {
        if !self.store.is_owner_allowed(owner) {
            debug!(%owner, "owner not allowed");
            return Ok(error_frame(owner, ErrorCode::OwnerNotAllowed));
        }

        let request = match codec::decode(frame) {
            Ok(Envelope::Request(request)) => request,
            Ok(other) => {
                return Err(ProtocolDecodeError::UnexpectedMessageType(
                    other.message_type() as u8,
                ))
            }
            Err(ProtocolDecodeError::UnsupportedVersion(version)) => {
                debug!(%owner, version, "unsupported protocol version");
                return Ok(error_frame(owner, ErrorCode::UnsupportedVersion));
            }
            Err(e) => return Err(e),
        };

        if request.owner != *owner {
            debug!(%owner, frame_owner = %request.owner, "owner mismatch");
            return Ok(error_frame(owner, ErrorCode::OwnerMismatch));
        }

        match self.sync(&request).await {
            Ok(response) => Ok(codec::encode(&Envelope::Response(response))),
            Err(code) => Ok(error_frame(owner, code)),
        }
    }

    async fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, ErrorCode> {
        let owner = &request.owner;

        if !request.messages.is_empty() {
            let Some(key) = &request.write_key else {
                return Err(ErrorCode::MissingWriteKey);
            };
            let valid = self
                .store
                .validate_write_key(owner, key)
                .await
                .map_err(|e| storage_failure(owner, e))?;
            if !valid {
                debug!(%owner, "write key mismatch");
                return Err(ErrorCode::WriteKeyMismatch);
            }

            match self.store.write_messages(owner, &request.messages).await {
                Ok(outcome) => debug!(
                    %owner,
                    inserted = outcome.inserted,
                    ignored = outcome.ignored,
                    "stored batch"
                ),
                Err(StoreError::QuotaExceeded { required_bytes, .. }) => {
                    debug!(%owner, required_bytes, "quota exceeded");
                    return Err(ErrorCode::QuotaExceeded);
                }
                Err(e) => return Err(storage_failure(owner, e)),
            }
        }

        let tree = self
            .store
            .merkle_tree(owner)
            .await
            .map_err(|e| storage_failure(owner, e))?;

        let messages = match diff(&tree, &request.tree) {
            None => Vec::new(),
            Some(watermark) => {
                let messages = self
                    .store
                    .messages_since(owner, watermark, Some(request.node))
                    .await
                    .map_err(|e| storage_failure(owner, e))?;
                let mut budget = limits::BatchBudget::default();
                messages
                    .into_iter()
                    .filter(|m| request.after.map_or(true, |after| m.timestamp > after))
                    .take_while(|m| budget.admit(m.change.len()))
                    .collect()
            }
        };

        Ok(SyncResponse {
            owner: *owner,
            messages,
            tree,
        })
    }
}

#[async_trait]
impl<R: RelayStore + 'static> FrameHandler for Relay<R> {
    async fn handle_frame(&self, owner: &OwnerId, frame: &[u8]) -> Option<Vec<u8>> {
        match self.handle(owner, frame).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(%owner, error = %e, "dropping connection on malformed frame");
                None
            }
        }
    }
}
