use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::billing::domain::EventNotifier;
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::runtime::session::BillingSession;
use crate::billing::store::StoreApi;
use crate::billing::types::{FlowContext, ProductDetails, ProductId, PurchaseState};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Requests a host makes of a running driver.
#[derive(Debug)]
pub enum HostCommand {
    RefreshPurchases,
    Resume,
    QueryDetails,
    CheckDetailsFreshness,
    Launch {
        context: FlowContext,
        product: ProductId,
        upgrade_from: Vec<ProductId>,
        reply: oneshot::Sender<BillingResult<()>>,
    },
    Consume {
        product: ProductId,
        reply: oneshot::Sender<BillingResult<()>>,
    },
    Shutdown,
}

/// Runs a [`BillingSession`] on a tokio task.
///
/// Host commands arrive over a channel, the store client is polled on a fixed
/// interval, and the reconnect deadline is the only timer.
pub struct BillingDriver<C> {
    session: BillingSession<C>,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    poll_interval: Duration,
}

impl<C> BillingDriver<C>
where
    C: StoreApi + Send + 'static,
{
    pub fn new(session: BillingSession<C>, poll_interval: Duration) -> (Self, BillingHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let catalog = session.catalog();
        let mut states = BTreeMap::new();
        let mut details = BTreeMap::new();
        for id in catalog.ids() {
            if let (Ok(s), Ok(d)) = (catalog.watch_state(id), catalog.watch_details(id)) {
                states.insert(id.clone(), s);
                details.insert(id.clone(), d);
            }
        }

        let handle = BillingHandle {
            commands: tx,
            notifier: session.notifier().clone(),
            states,
            details,
        };

        let driver = Self {
            session,
            commands: rx,
            poll_interval,
        };
        (driver, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!("[DRIVER] starting driver");
        self.session.start();

        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect = self.session.reconnect_deadline();
            tokio::select! {
                cmd = self.commands.recv() => {
                    // every handle dropped counts as a shutdown
                    let cmd = cmd.unwrap_or(HostCommand::Shutdown);
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                _ = poll.tick() => {
                    self.session.tick_at(Instant::now().into_std());
                }
                _ = reconnect_timer(reconnect) => {
                    log::trace!("[DRIVER] reconnect deadline reached");
                    self.session.tick_at(Instant::now().into_std());
                }
            }
        }
    }

    /// Returns `false` once the driver should stop.
    fn handle_command(&mut self, cmd: HostCommand) -> bool {
        log::trace!("[DRIVER] command {:?}", cmd);
        match cmd {
            HostCommand::RefreshPurchases => self.session.refresh_purchases(),
            HostCommand::Resume => self.session.resume(),
            HostCommand::QueryDetails => self.session.query_details(),
            HostCommand::CheckDetailsFreshness => {
                self.session.check_details_freshness(Instant::now().into_std())
            }
            HostCommand::Launch {
                context,
                product,
                upgrade_from,
                reply,
            } => {
                let result = self.session.launch_purchase(context, &product, &upgrade_from);
                let _ = reply.send(result);
            }
            HostCommand::Consume { product, reply } => {
                let result = self.session.consume_product(&product);
                let _ = reply.send(result);
            }
            HostCommand::Shutdown => {
                log::info!("[DRIVER] shutting down");
                self.session.end_connection();
                return false;
            }
        }
        true
    }
}

async fn reconnect_timer(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Host side of a running [`BillingDriver`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BillingHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    notifier: EventNotifier,
    states: BTreeMap<ProductId, watch::Receiver<PurchaseState>>,
    details: BTreeMap<ProductId, watch::Receiver<Option<ProductDetails>>>,
}

impl BillingHandle {
    fn send(&self, cmd: HostCommand) -> BillingResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| BillingError::ConnectionLost)
    }

    pub fn refresh_purchases(&self) -> BillingResult<()> {
        self.send(HostCommand::RefreshPurchases)
    }

    pub fn resume(&self) -> BillingResult<()> {
        self.send(HostCommand::Resume)
    }

    pub fn query_details(&self) -> BillingResult<()> {
        self.send(HostCommand::QueryDetails)
    }

    pub async fn launch_purchase(
        &self,
        context: FlowContext,
        product: ProductId,
        upgrade_from: Vec<ProductId>,
    ) -> BillingResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Launch {
            context,
            product,
            upgrade_from,
            reply,
        })?;
        rx.await.map_err(|_| BillingError::ConnectionLost)?
    }

    pub async fn consume(&self, product: ProductId) -> BillingResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Consume { product, reply })?;
        rx.await.map_err(|_| BillingError::ConnectionLost)?
    }

    pub fn shutdown(&self) -> BillingResult<()> {
        self.send(HostCommand::Shutdown)
    }

    pub fn watch_state(&self, id: &ProductId) -> BillingResult<watch::Receiver<PurchaseState>> {
        self.states
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::UnknownProduct(id.clone()))
    }

    /// Observes a product's details; stale details are re-queried.
    pub fn observe_details(
        &self,
        id: &ProductId,
    ) -> BillingResult<watch::Receiver<Option<ProductDetails>>> {
        let rx = self
            .details
            .get(id)
            .cloned()
            .ok_or_else(|| BillingError::UnknownProduct(id.clone()))?;
        self.send(HostCommand::CheckDetailsFreshness)?;
        Ok(rx)
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }
}
