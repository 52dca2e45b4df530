pub mod backoff;
pub mod catalog;
pub mod notifier;

pub use backoff::ReconnectBackoff;
pub use catalog::ProductCatalog;
pub use notifier::EventNotifier;
