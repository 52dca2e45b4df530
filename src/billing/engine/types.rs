use crate::billing::error::BillingError;
use crate::billing::types::PurchaseToken;

/// Side effect the reconciler asks the session to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileCommand {
    Acknowledge(PurchaseToken),
    Consume(PurchaseToken),
}

/// Result of reconciling one batch of purchase records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Acknowledge / consume requests to issue, at most one per token.
    pub commands: Vec<ReconcileCommand>,

    /// Problems found while processing the batch (logged and skipped).
    pub errors: Vec<BillingError>,
}
