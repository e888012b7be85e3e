//! Pool management service layer

mod manager;

pub use manager::{CreatePoolRequest, PoolManager, PoolManagerConfig};
