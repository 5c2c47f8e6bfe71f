//! Background purchase acknowledgement
//!
//! New purchases are acknowledged off the request path. Jobs go through a
//! bounded queue drained by one worker; a full queue drops the job with a
//! warning and the next verification of the purchase retries it.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::{token_fingerprint, BillingVerifier};
use crate::billing::ProductKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgementJob {
    pub kind: ProductKind,
    pub product_id: String,
    pub purchase_token: String,
}

/// Sending side of the acknowledgement queue
#[derive(Clone)]
pub struct Acknowledger {
    tx: Option<mpsc::Sender<AcknowledgementJob>>,
}

impl Acknowledger {
    /// Start the worker on the current runtime; disabled when none is running
    pub fn spawn(verifier: Arc<dyn BillingVerifier>, capacity: usize) -> Self {
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime, purchase acknowledgements disabled");
            return Self::disabled();
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        handle.spawn(run_worker(verifier, rx));
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a job without waiting; returns false when it was dropped
    pub fn enqueue(&self, job: AcknowledgementJob) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    product_id = %job.product_id,
                    token = %token_fingerprint(&job.purchase_token),
                    "Acknowledgement queue full, dropping job"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    product_id = %job.product_id,
                    "Acknowledgement worker stopped, dropping job"
                );
                false
            }
        }
    }
}

async fn run_worker(verifier: Arc<dyn BillingVerifier>, mut rx: mpsc::Receiver<AcknowledgementJob>) {
    debug!("Acknowledgement worker started");

    while let Some(job) = rx.recv().await {
        let token = token_fingerprint(&job.purchase_token);
        if verifier
            .acknowledge_purchase(job.kind, &job.product_id, &job.purchase_token)
            .await
        {
            info!(product_id = %job.product_id, token = %token, "Purchase acknowledged");
        } else {
            warn!(product_id = %job.product_id, token = %token, "Purchase acknowledgement failed");
        }
    }

    debug!("Acknowledgement worker stopped");
}
