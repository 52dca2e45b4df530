// Known products, their observable purchase state and cached details

use std::collections::BTreeMap;

use tokio::sync::watch;

use crate::billing::error::{BillingError, BillingResult};
use crate::billing::types::{ProductDetails, ProductId, ProductKind, PurchaseState};

#[derive(Debug)]
struct ProductEntry {
    kind: ProductKind,
    auto_consume: bool,
    state: watch::Sender<PurchaseState>,
    details: watch::Sender<Option<ProductDetails>>,
}

/// Registry of every product the storefront knows about.
///
/// Products are registered up front and never removed. Each one carries two
/// durable observable values: its purchase state and its cached details. Any
/// number of observers may attach at any time and always see the latest value.
#[derive(Debug, Default)]
pub struct ProductCatalog {
    products: BTreeMap<ProductId, ProductEntry>,
}

impl ProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a product.
    ///
    /// Re-registering an id with the same kind is a no-op; registering it under
    /// the other kind fails, since regular and subscription ids are disjoint.
    pub fn register(
        &mut self,
        id: ProductId,
        kind: ProductKind,
        auto_consume: bool,
    ) -> BillingResult<()> {
        if let Some(existing) = self.products.get(&id) {
            if existing.kind != kind {
                return Err(BillingError::DuplicateProduct {
                    id,
                    existing: existing.kind,
                });
            }
            return Ok(());
        }

        log::debug!("[CATALOG] register {} ({}, auto_consume={})", id, kind, auto_consume);
        let (state, _) = watch::channel(PurchaseState::Unpurchased);
        let (details, _) = watch::channel(None);
        self.products.insert(
            id,
            ProductEntry {
                kind,
                auto_consume,
                state,
                details,
            },
        );
        Ok(())
    }

    fn entry(&self, id: &ProductId) -> BillingResult<&ProductEntry> {
        self.products
            .get(id)
            .ok_or_else(|| BillingError::UnknownProduct(id.clone()))
    }

    pub fn contains(&self, id: &ProductId) -> bool {
        self.products.contains_key(id)
    }

    pub fn state(&self, id: &ProductId) -> BillingResult<PurchaseState> {
        Ok(*self.entry(id)?.state.borrow())
    }

    pub fn set_state(&self, id: &ProductId, state: PurchaseState) -> BillingResult<()> {
        let entry = self.entry(id)?;
        let prev = entry.state.send_replace(state);
        if prev != state {
            log::debug!("[CATALOG] {}: {:?} -> {:?}", id, prev, state);
        }
        Ok(())
    }

    pub fn details(&self, id: &ProductId) -> BillingResult<Option<ProductDetails>> {
        Ok(self.entry(id)?.details.borrow().clone())
    }

    pub fn set_details(&self, id: &ProductId, details: ProductDetails) -> BillingResult<()> {
        self.entry(id)?.details.send_replace(Some(details));
        Ok(())
    }

    pub fn kind(&self, id: &ProductId) -> BillingResult<ProductKind> {
        Ok(self.entry(id)?.kind)
    }

    pub fn is_auto_consume(&self, id: &ProductId) -> BillingResult<bool> {
        Ok(self.entry(id)?.auto_consume)
    }

    /// Entitlement check: only an acknowledged purchase counts.
    pub fn is_purchased(&self, id: &ProductId) -> BillingResult<bool> {
        Ok(self.state(id)? == PurchaseState::PurchasedAndAcknowledged)
    }

    /// A product can be bought once its details are known and nothing is
    /// currently held or pending for it.
    pub fn can_purchase(&self, id: &ProductId) -> BillingResult<bool> {
        let entry = self.entry(id)?;
        if entry.details.borrow().is_none() {
            return Ok(false);
        }
        Ok(*entry.state.borrow() == PurchaseState::Unpurchased)
    }

    pub fn title(&self, id: &ProductId) -> BillingResult<Option<String>> {
        Ok(self.details(id)?.map(|d| d.title))
    }

    pub fn price(&self, id: &ProductId) -> BillingResult<Option<String>> {
        Ok(self.details(id)?.map(|d| d.price))
    }

    pub fn description(&self, id: &ProductId) -> BillingResult<Option<String>> {
        Ok(self.details(id)?.map(|d| d.description))
    }

    /// All ids of one kind, in stable order.
    pub fn ids_of_kind(&self, kind: ProductKind) -> Vec<ProductId> {
        self.products
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProductId> {
        self.products.keys()
    }

    pub fn watch_state(&self, id: &ProductId) -> BillingResult<watch::Receiver<PurchaseState>> {
        Ok(self.entry(id)?.state.subscribe())
    }

    pub fn watch_details(
        &self,
        id: &ProductId,
    ) -> BillingResult<watch::Receiver<Option<ProductDetails>>> {
        Ok(self.entry(id)?.details.subscribe())
    }
}
