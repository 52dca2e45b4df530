pub mod api;
pub mod mock_client;

pub use api::{ConnectionId, FlowParams, RequestId, StoreApi, StoreEvent};
pub use mock_client::{MockStore, MockStoreClient, StoreCall};
