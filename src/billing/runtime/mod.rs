pub mod driver;
pub mod listener;
pub mod session;

#[cfg(test)]
mod tests;

pub use driver::{BillingDriver, BillingHandle, HostCommand, DEFAULT_POLL_INTERVAL};
pub use listener::BillingListener;
pub use session::{BillingSession, ConnectionState, DEFAULT_DETAILS_STALE_AFTER};
