//! Purchase reconciliation engine.
//!
//! This module implements the **Functional Core** of the billing logic:
//! - **Input**: batches of purchase records and acknowledge/consume results.
//! - **Output**: per-product state in the catalog, notifications, and the
//!   `ReconcileCommand`s the session must send to the store.
//!
//! # Guarantees
//! * **No IO**: it never talks to the store service itself.
//! * **Signature gate**: no product reaches `Purchased` or beyond unless the
//!   verifier accepted the purchase.
//! * **Exactly once**: a token is never acknowledged or consumed twice while a
//!   previous request for it is still in flight.

pub mod state;
mod logic;
pub mod types;


pub use crate::billing::engine::types::{ReconcileCommand, ReconcileOutcome};
pub use logic::unmasked_state;

use std::collections::HashMap;

use crate::billing::domain::{EventNotifier, ProductCatalog};
use crate::billing::error::BillingResult;
use crate::billing::types::{ProductId, PurchaseRecord, PurchaseToken, ResponseCode};
use crate::billing::verifier::SignatureVerifier;

use state::ReconcilerState;

pub struct PurchaseReconciler {
    state: ReconcilerState,
}

impl PurchaseReconciler {
    /// Creates a reconciler over an already populated catalog.
    ///
    /// # Arguments
    /// * `public_key` - Verification key every purchase signature is checked against.
    /// * `verifier` - The signature capability.
    pub fn new(
        catalog: ProductCatalog,
        notifier: EventNotifier,
        public_key: impl Into<String>,
        verifier: Box<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            state: ReconcilerState {
                catalog,
                notifier,
                public_key: public_key.into(),
                verifier,
                consuming: HashMap::new(),
                acknowledging: HashMap::new(),
            },
        }
    }

    /// Derives per-product state from a batch of purchase records.
    ///
    /// With `expected` set (refresh mode), every expected product absent from the
    /// batch is reset to `Unpurchased`.
    pub fn reconcile(
        &mut self,
        purchases: &[PurchaseRecord],
        expected: Option<&[ProductId]>,
    ) -> ReconcileOutcome {
        logic::reconcile(&mut self.state, purchases, expected)
    }

    /// Asks for consumption of a purchase found by a host "consume this product"
    /// request.
    ///
    /// The purchase must be in the purchased state and carry a valid signature.
    /// Returns `Ok(None)` when the token is already being consumed.
    pub fn consume(&mut self, purchase: &PurchaseRecord) -> BillingResult<Option<ReconcileCommand>> {
        logic::consume_checked(&mut self.state, purchase)
    }

    pub fn on_consume_result(&mut self, token: &PurchaseToken, code: ResponseCode) {
        logic::on_consume_result(&mut self.state, token, code)
    }

    pub fn on_acknowledge_result(&mut self, token: &PurchaseToken, code: ResponseCode) {
        logic::on_acknowledge_result(&mut self.state, token, code)
    }

    /// Forgets every in-flight acknowledge/consume.
    ///
    /// Only for session teardown. A plain disconnect keeps them, since
    /// requests already sent run to completion.
    pub fn abandon_in_flight(&mut self) {
        if !self.state.consuming.is_empty() || !self.state.acknowledging.is_empty() {
            log::warn!(
                "[RECONCILER] abandoning {} consumptions and {} acknowledgements in flight",
                self.state.consuming.len(),
                self.state.acknowledging.len()
            );
        }
        self.state.consuming.clear();
        self.state.acknowledging.clear();
    }

    pub fn is_consuming(&self, token: &PurchaseToken) -> bool {
        self.state.consuming.contains_key(token)
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.consuming.len() + self.state.acknowledging.len()
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.state.catalog
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.state.notifier
    }
}
