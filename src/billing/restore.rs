//! Purchase restoration
//!
//! Re-applies purchases a client reports after reinstalling or switching
//! devices. Tokens carry no product id, so each one is matched against
//! earlier successful verifications first and probed across the catalog
//! otherwise.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::Product;
use super::purchase::{Attempt, PurchaseProcessor};
use super::types::{
    AccountId, Outcome, Rejection, Subscription, VerificationRecord, VerificationStatus,
    VerificationType,
};
use crate::clock::Clock;
use crate::error::EngineResult;
use crate::store::PersistenceGateway;
use crate::verifier::{token_fingerprint, AbortSignal, VerifierError};

pub struct RestorationResolver {
    processor: Arc<PurchaseProcessor>,
    store: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
}

impl RestorationResolver {
    pub fn new(
        processor: Arc<PurchaseProcessor>,
        store: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            processor,
            store,
            clock,
        }
    }

    /// Apply every token that still verifies, returning the last one applied
    pub async fn restore(
        &self,
        account_id: AccountId,
        purchase_tokens: &[String],
        abort: &AbortSignal,
    ) -> EngineResult<Outcome<Subscription>> {
        let tokens: Vec<&str> = purchase_tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok(Err(Rejection::NoPurchaseTokens));
        }

        info!(account_id, count = tokens.len(), "Restoring purchases");

        let mut restored: Option<Subscription> = None;
        let mut applied = 0usize;

        for token in tokens {
            if abort.is_aborted() {
                warn!(account_id, "Restoration aborted");
                break;
            }

            let Some((product, attempt)) = self.resolve(account_id, token, abort).await? else {
                continue;
            };

            match self
                .processor
                .settle(account_id, &product, token, attempt)
                .await?
            {
                Ok(subscription) => {
                    applied += 1;
                    restored = Some(subscription);
                }
                Err(rejection) => {
                    debug!(
                        account_id,
                        token = %token_fingerprint(token),
                        reason = %rejection,
                        "Token not restored"
                    );
                }
            }
        }

        match restored {
            Some(subscription) => {
                info!(account_id, applied, tier = %subscription.tier, "Restored purchases");
                Ok(Ok(subscription))
            }
            None => Ok(Err(Rejection::NothingToRestore)),
        }
    }

    /// Find the catalog product a token belongs to.
    ///
    /// Returns the attempt to settle, or None once a single Failed record
    /// has been written for a token no product recognises.
    async fn resolve(
        &self,
        account_id: AccountId,
        purchase_token: &str,
        abort: &AbortSignal,
    ) -> EngineResult<Option<(Product, Attempt)>> {
        let catalog = self.processor.catalog();

        if let Some(known) = self
            .store
            .latest_successful_verification(purchase_token)
            .await?
        {
            if let Some(product) = catalog.lookup(&known.product_id) {
                debug!(
                    account_id,
                    product_id = %product.product_id,
                    "Product known from earlier verification"
                );
                let attempt = self
                    .processor
                    .verify(account_id, product, purchase_token, VerificationType::Manual, abort)
                    .await;
                return Ok(Some((product.clone(), attempt)));
            }
        }

        let mut last_failure = None;
        for product in catalog.products() {
            let attempt = self
                .processor
                .verify(account_id, product, purchase_token, VerificationType::Manual, abort)
                .await;

            if attempt.result.is_ok() {
                return Ok(Some((product.clone(), attempt)));
            }
            let aborted = matches!(attempt.result, Err(VerifierError::Aborted));
            last_failure = Some(attempt.record);
            if aborted {
                break;
            }
        }

        let mut record = match last_failure {
            Some(record) => record,
            None => {
                // Empty catalog
                let now = self.clock.now();
                let mut record = VerificationRecord::pending(
                    account_id,
                    purchase_token,
                    "",
                    VerificationType::Manual,
                    now,
                );
                record.completed_at = Some(now);
                record
            }
        };
        record.status = VerificationStatus::Failed;
        let cause = record.error_message.take().unwrap_or_default();
        record.error_message = Some(format!("no catalog product matched the token: {}", cause));
        self.store.append_verification_record(&record).await?;

        warn!(
            account_id,
            token = %token_fingerprint(purchase_token),
            "Could not match purchase token to any product"
        );
        Ok(None)
    }
}
