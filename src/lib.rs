pub mod billing;
pub mod config;

use billing::domain::{EventNotifier, ProductCatalog};
use billing::engine::PurchaseReconciler;
use billing::error::BillingResult;
use billing::runtime::BillingSession;
use billing::store::StoreApi;
use billing::types::ProductKind;
use billing::verifier::Ed25519Verifier;
use config::BillingConfig;

/// Builds a session over `client` from a validated config, verifying purchase
/// signatures with ed25519.
pub fn setup_session<C: StoreApi>(config: &BillingConfig, client: C) -> BillingResult<BillingSession<C>> {
    config.validate()?;

    let mut catalog = ProductCatalog::new();
    for id in &config.regular_ids {
        let auto_consume = config.auto_consume_ids.contains(id);
        catalog.register(id.clone(), ProductKind::Regular, auto_consume)?;
    }
    for id in &config.subscription_ids {
        catalog.register(id.clone(), ProductKind::Subscription, false)?;
    }

    let reconciler = PurchaseReconciler::new(
        catalog,
        EventNotifier::new(),
        config.public_key.clone(),
        Box::new(Ed25519Verifier),
    );

    Ok(BillingSession::new(client, reconciler, config.backoff())
        .with_details_stale_after(config.details_stale_after()))
}
