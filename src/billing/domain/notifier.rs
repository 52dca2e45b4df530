//! Purchase notifications for the host.
//!
//! Two kinds of signal leave the billing core:
//! * **single-delivery events** ("new purchase", "purchase consumed"): each event
//!   reaches at most one subscriber, exactly once. Subscribing again replaces the
//!   previous subscriber. While nobody listens, only the latest event is held;
//!   it is handed to the next subscriber, then forgotten.
//! * **durable flags** ("flow in progress"): a `watch` value any number of
//!   observers can read at any time.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::billing::types::PurchaseRecord;

#[derive(Debug)]
struct SingleDelivery<T> {
    subscriber: Option<mpsc::UnboundedSender<T>>,
    pending: Option<T>,
}

impl<T> Default for SingleDelivery<T> {
    fn default() -> Self {
        Self {
            subscriber: None,
            pending: None,
        }
    }
}

impl<T> SingleDelivery<T> {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(item) = self.pending.take() {
            // receiver is alive in this scope
            let _ = tx.send(item);
        }
        self.subscriber = Some(tx);
        rx
    }

    fn emit(&mut self, item: T) {
        let item = match &self.subscriber {
            Some(tx) => match tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => item,
        };
        // subscriber went away: hold the latest until someone attaches
        self.subscriber = None;
        self.pending = Some(item);
    }
}

#[derive(Debug, Default)]
struct Channels {
    new_purchase: SingleDelivery<PurchaseRecord>,
    consumed: SingleDelivery<PurchaseRecord>,
}

/// Cloneable notification hub shared by the session and its host.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    channels: Arc<Mutex<Channels>>,
    flow_in_progress: Arc<watch::Sender<bool>>,
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier {
    pub fn new() -> Self {
        let (flow, _) = watch::channel(false);
        Self {
            channels: Arc::new(Mutex::new(Channels::default())),
            flow_in_progress: Arc::new(flow),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe_new_purchases(&self) -> mpsc::UnboundedReceiver<PurchaseRecord> {
        self.channels().new_purchase.subscribe()
    }

    pub fn subscribe_consumed(&self) -> mpsc::UnboundedReceiver<PurchaseRecord> {
        self.channels().consumed.subscribe()
    }

    pub fn emit_new_purchase(&self, purchase: PurchaseRecord) {
        log::info!("[NOTIFIER] new purchase {} {:?}", purchase.token, purchase.products);
        self.channels().new_purchase.emit(purchase);
    }

    pub fn emit_consumed(&self, purchase: PurchaseRecord) {
        log::info!("[NOTIFIER] purchase consumed {} {:?}", purchase.token, purchase.products);
        self.channels().consumed.emit(purchase);
    }

    pub fn set_flow_in_progress(&self, in_progress: bool) {
        self.flow_in_progress.send_replace(in_progress);
    }

    pub fn flow_in_progress(&self) -> bool {
        *self.flow_in_progress.borrow()
    }

    pub fn watch_flow_in_progress(&self) -> watch::Receiver<bool> {
        self.flow_in_progress.subscribe()
    }
}
