/// Traits and types for all system components.
pub mod components;

/// Environment-derived configuration.
pub mod env;

/// Logging setup and helpers.
pub mod log;

/// Utilities.
pub mod util;

/// A prelude that makes all system component traits and data types available.
///
/// Add the following code to import all traits and data types listed below at once.
///
/// ```
/// use seine::prelude::*;
/// ```
pub mod prelude {
    pub use anyhow::{anyhow, bail, Context, Error};
    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use slog::{crit, debug, error, info, o, trace, warn, Logger};
    pub use std::collections::HashMap;
    pub use std::sync::Arc;
    pub use tokio;
    pub use web3;

    pub use crate::components::engine::{ChainHead, EngineFlags, MetaEntity, SyncOp};
    pub use crate::components::ethereum::{
        BlockNumberStream, BlockParts, EthereumAdapter, PartsHandle, ProviderError,
    };
    pub use crate::components::processor::BlockProcessor;
    pub use crate::components::store::{
        BatchOp, Entity, Store, StoreError, StoreKey, StoreValue, BLOCK_NUM, BLOCK_TS, CHAIN_ID,
        META_COLLECTION, OBJECT_ID,
    };
    pub use crate::env::ENV_VARS;
    pub use crate::log::LoggerFactory;
    pub use crate::util::futures::{retry, TimeoutError};
}
