mod adapter;
mod types;

pub use adapter::{BlockNumberStream, EthereumAdapter, ProviderError};
pub use types::{BlockParts, PartsHandle};
