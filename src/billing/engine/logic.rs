use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use crate::billing::engine::state::ReconcilerState;
use crate::billing::engine::types::{ReconcileCommand, ReconcileOutcome};
use crate::billing::error::BillingError;
use crate::billing::types::{
    ProductId, ProviderPurchaseState, PurchaseRecord, PurchaseState, PurchaseToken, ResponseCode,
};

/// Recovers the purchase status from the raw provider payload.
///
/// The provider's own status field is overloaded, so the payload's
/// `purchaseState` wins: `0` purchased, `4` pending, anything else (including
/// a missing field) unspecified. Only an unparseable payload falls back to the
/// provider field.
pub fn unmasked_state(purchase: &PurchaseRecord) -> ProviderPurchaseState {
    let fields = match serde_json::from_str::<Value>(&purchase.original_json) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) | Err(_) => {
            log::warn!(
                "[RECONCILER] unparseable payload for {}, using provider state {:?}",
                purchase.token,
                purchase.provider_state
            );
            return purchase.provider_state;
        }
    };

    let raw = fields
        .get("purchaseState")
        .and_then(|v| v.as_i64().or_else(|| v.as_str()?.trim().parse().ok()))
        .unwrap_or(1);

    match raw {
        0 => ProviderPurchaseState::Purchased,
        4 => ProviderPurchaseState::Pending,
        _ => ProviderPurchaseState::Unspecified,
    }
}

pub fn reconcile(
    state: &mut ReconcilerState,
    purchases: &[PurchaseRecord],
    expected: Option<&[ProductId]>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let mut seen: HashSet<ProductId> = HashSet::new();

    if purchases.is_empty() {
        log::debug!("[RECONCILER] empty purchase list");
    }

    for purchase in purchases {
        for id in &purchase.products {
            if state.catalog.contains(id) {
                seen.insert(id.clone());
            } else {
                log::error!(
                    "[RECONCILER] unknown product {} in purchase {}; check the store listing",
                    id,
                    purchase.token
                );
                outcome.errors.push(BillingError::UnknownProduct(id.clone()));
            }
        }

        match unmasked_state(purchase) {
            ProviderPurchaseState::Purchased => {
                on_purchased(state, purchase, &mut outcome);
            }
            ProviderPurchaseState::Pending => {
                apply_state(state, &purchase.products, PurchaseState::Pending);
            }
            ProviderPurchaseState::Unspecified => {
                apply_state(state, &purchase.products, PurchaseState::Unpurchased);
            }
        }
    }

    // Refresh mode: whatever the provider stopped reporting is no longer held.
    if let Some(expected) = expected {
        for id in expected.iter().filter(|id| !seen.contains(*id)) {
            if let Err(e) = state.catalog.set_state(id, PurchaseState::Unpurchased) {
                log::error!("[RECONCILER] {}", e);
            }
        }
    }

    outcome
}

fn on_purchased(state: &mut ReconcilerState, purchase: &PurchaseRecord, outcome: &mut ReconcileOutcome) {
    if !state
        .verifier
        .verify(&state.public_key, &purchase.original_json, &purchase.signature)
    {
        log::error!(
            "[RECONCILER] invalid signature on purchase {}; check the configured public key",
            purchase.token
        );
        outcome.errors.push(BillingError::InvalidSignature {
            token: purchase.token.clone(),
        });
        return;
    }

    let granted = if purchase.acknowledged {
        PurchaseState::PurchasedAndAcknowledged
    } else {
        PurchaseState::Purchased
    };
    apply_state(state, &purchase.products, granted);

    let consumable = match bundle_consumability(state, purchase) {
        Ok(c) => c,
        Err(e) => {
            log::error!("[RECONCILER] {}", e);
            outcome.errors.push(e);
            return;
        }
    };

    if consumable {
        if let Some(cmd) = begin_consume(state, purchase) {
            outcome.commands.push(cmd);
        }
    } else if !purchase.acknowledged {
        if let Some(cmd) = begin_acknowledge(state, purchase) {
            outcome.commands.push(cmd);
        }
    }
}

/// A bundle is consumable only if every known product in it is auto-consume.
fn bundle_consumability(state: &ReconcilerState, purchase: &PurchaseRecord) -> Result<bool, BillingError> {
    let flags: BTreeSet<bool> = purchase
        .products
        .iter()
        .filter_map(|id| state.catalog.is_auto_consume(id).ok())
        .collect();

    match flags.len() {
        0 | 1 => Ok(flags.contains(&true)),
        _ => Err(BillingError::MixedConsumabilityBundle {
            token: purchase.token.clone(),
            products: purchase.products.clone(),
        }),
    }
}

fn apply_state(state: &ReconcilerState, products: &[ProductId], new_state: PurchaseState) {
    for id in products {
        if let Err(e) = state.catalog.set_state(id, new_state) {
            log::error!("[RECONCILER] {}", e);
        }
    }
}

pub fn consume_checked(
    state: &mut ReconcilerState,
    purchase: &PurchaseRecord,
) -> Result<Option<ReconcileCommand>, BillingError> {
    if unmasked_state(purchase) != ProviderPurchaseState::Purchased {
        return Err(BillingError::Provider {
            code: ResponseCode::ItemNotOwned,
            operation: "consume",
        });
    }
    if !state
        .verifier
        .verify(&state.public_key, &purchase.original_json, &purchase.signature)
    {
        return Err(BillingError::InvalidSignature {
            token: purchase.token.clone(),
        });
    }
    Ok(begin_consume(state, purchase))
}

pub fn begin_consume(state: &mut ReconcilerState, purchase: &PurchaseRecord) -> Option<ReconcileCommand> {
    if state.consuming.contains_key(&purchase.token) {
        log::debug!("[RECONCILER] {} already being consumed", purchase.token);
        return None;
    }
    state
        .consuming
        .insert(purchase.token.clone(), purchase.clone());
    Some(ReconcileCommand::Consume(purchase.token.clone()))
}

pub fn begin_acknowledge(
    state: &mut ReconcilerState,
    purchase: &PurchaseRecord,
) -> Option<ReconcileCommand> {
    if state.acknowledging.contains_key(&purchase.token) {
        log::debug!("[RECONCILER] {} already being acknowledged", purchase.token);
        return None;
    }
    state
        .acknowledging
        .insert(purchase.token.clone(), purchase.clone());
    Some(ReconcileCommand::Acknowledge(purchase.token.clone()))
}

pub fn on_consume_result(state: &mut ReconcilerState, token: &PurchaseToken, code: ResponseCode) {
    let Some(purchase) = state.consuming.remove(token) else {
        log::debug!("[RECONCILER] consume result for {} with nothing in flight", token);
        return;
    };

    if !code.is_ok() {
        log::error!("[RECONCILER] error while consuming {}: {}", token, code);
        return;
    }

    log::info!("[RECONCILER] consumption of {} successful, delivering entitlement", token);
    // the slot is free again for repurchase
    apply_state(state, &purchase.products, PurchaseState::Unpurchased);
    state.notifier.emit_consumed(purchase.clone());
    state.notifier.emit_new_purchase(purchase);
}

pub fn on_acknowledge_result(state: &mut ReconcilerState, token: &PurchaseToken, code: ResponseCode) {
    let Some(purchase) = state.acknowledging.remove(token) else {
        log::debug!("[RECONCILER] acknowledge result for {} with nothing in flight", token);
        return;
    };

    if !code.is_ok() {
        log::error!("[RECONCILER] error while acknowledging {}: {}", token, code);
        return;
    }

    log::info!("[RECONCILER] purchase {} acknowledged", token);
    apply_state(state, &purchase.products, PurchaseState::PurchasedAndAcknowledged);
    state.notifier.emit_new_purchase(purchase);
}
