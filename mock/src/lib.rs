//! Scripted test doubles for the ingestion core: a canned Ethereum adapter,
//! an in-memory store, and a recording block processor.

mod ethereum_adapter;
mod processor;
mod store;

pub use ethereum_adapter::{block, receipt, transaction, MockEthereumAdapter};
pub use processor::RecordingProcessor;
pub use store::MockStore;
