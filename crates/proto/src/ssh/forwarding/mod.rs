//! Remote port forwarding bookkeeping.
//!
//! `tcpip-forward` asks the server to listen on its side. Each successful
//! bind is recorded in a [`ForwardingTable`]; incoming `forwarded-tcpip`
//! opens are only accepted when they name an active binding.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::forwarding::ForwardingTable;
//!
//! let mut table = ForwardingTable::new();
//! table.insert("0.0.0.0", 8080, 8080, 8080);
//! assert_eq!(table.resolve("0.0.0.0", 8080), Some(8080));
//! ```

pub mod table;
pub mod types;

pub use table::ForwardingTable;
pub use types::ForwardAddr;
