use std::collections::HashMap;

use crate::billing::domain::{EventNotifier, ProductCatalog};
use crate::billing::types::{PurchaseRecord, PurchaseToken};
use crate::billing::verifier::SignatureVerifier;

pub struct ReconcilerState {
    pub catalog: ProductCatalog,
    pub notifier: EventNotifier,

    /// Key handed to the verifier for every purchase.
    pub public_key: String,
    pub verifier: Box<dyn SignatureVerifier>,

    /// token -> purchase, for consumptions submitted and not yet answered
    pub consuming: HashMap<PurchaseToken, PurchaseRecord>,

    /// token -> purchase, for acknowledgements submitted and not yet answered
    pub acknowledging: HashMap<PurchaseToken, PurchaseRecord>,
}
