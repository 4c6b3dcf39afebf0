use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use wavesexchange_log::{debug, info, warn};

use crate::chain::{ChainQuery, TokenMetadata};
use crate::db::{get_or_create_token, RecordRepo, RecordRepoOperations, TokenMetadataUpdate};
use crate::error::{Error, Result};
use crate::models::TokenIdentity;

/// Sending half handed to the reconciler; a disabled queue drops requests.
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: Option<mpsc::Sender<String>>,
}

impl EnrichmentQueue {
    pub fn disabled() -> Self {
        EnrichmentQueue { tx: None }
    }

    pub async fn schedule(&self, tokenid: String) {
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.send(tokenid).await {
                warn!("token enrichment queue is closed, dropping {}", err.0);
            }
        }
    }
}

pub struct TokenEnricher<R, C> {
    repo: Arc<R>,
    chain: Arc<C>,
    rx: mpsc::Receiver<String>,
}

pub fn enrichment_channel<R, C>(
    repo: Arc<R>,
    chain: Arc<C>,
    capacity: usize,
) -> (EnrichmentQueue, TokenEnricher<R, C>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EnrichmentQueue { tx: Some(tx) },
        TokenEnricher { repo, chain, rx },
    )
}

impl<R, C> TokenEnricher<R, C>
where
    R: RecordRepo + Send + Sync + 'static,
    C: ChainQuery + 'static,
{
    pub async fn run(mut self) -> Result<()> {
        info!("token enricher started");
        while let Some(tokenid) = self.rx.recv().await {
            if let Err(err) = self.enrich(&tokenid).await {
                warn!("token {} enrichment failed: {}", tokenid, err);
            }
        }
        Err(Error::SendError("token enrichment channel closed".into()))
    }

    /// Overwrites the token's descriptive fields from upstream; safe to repeat.
    pub async fn enrich(&self, tokenid: &str) -> Result<()> {
        let metadata = self.chain.get_token_metadata(tokenid).await?;
        let group = self.store(tokenid, metadata).await?;

        // Group tokens are enriched once, without following their own parents.
        if let Some(group_id) = group {
            let group_metadata = self.chain.get_token_metadata(&group_id).await?;
            self.store(&group_id, TokenMetadata {
                nft_group_id: None,
                ..group_metadata
            })
            .await?;
        }
        Ok(())
    }

    /// Returns the group token id when the group row was created by this call.
    async fn store(&self, tokenid: &str, metadata: TokenMetadata) -> Result<Option<String>> {
        let identity = TokenIdentity::Overlay(tokenid.to_owned());
        self.repo
            .transaction(move |ops| {
                let (token, _) = get_or_create_token(ops, &identity)?;
                let (group_id, new_group) = match &metadata.nft_group_id {
                    Some(group) => {
                        let group_identity = TokenIdentity::try_from(group.as_str())?;
                        let (group_token, created) = get_or_create_token(ops, &group_identity)?;
                        let new_group = created.then(|| group_token.tokenid.clone());
                        (Some(group_token.id), new_group)
                    }
                    None => (None, None),
                };
                ops.update_token_metadata(token.id, &to_update(metadata, group_id))?;
                debug!("token {} enriched", token.tokenid);
                Ok(new_group)
            })
            .await
    }

    #[cfg(test)]
    pub fn try_next(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

fn to_update(metadata: TokenMetadata, group_id: Option<i64>) -> TokenMetadataUpdate {
    TokenMetadataUpdate {
        name: Some(metadata.name),
        token_ticker: Some(metadata.ticker),
        token_type: metadata.token_type,
        decimals: metadata.decimals,
        nft_token_group_id: group_id,
        original_image_url: metadata.image_url.clone(),
        thumbnail_image_url: metadata.image_url,
        metadata: None,
        date_updated: Some(Utc::now()),
    }
}
