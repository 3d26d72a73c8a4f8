//! Backend adapters: one per database family, each turning a
//! [`ConnectionDescriptor`](dbconn_core::ConnectionDescriptor) into a live pool.

mod params;

pub mod adapter;
pub mod connect;
pub mod mssql;
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod sqlite;

pub use adapter::{AdapterSet, BackendAdapter, BackendPool, PoolHandle, Row};
pub use connect::{connect_url, redacted};
pub use params::parse_param;
