//! Protocol Module
//!
//! The framed connection abstraction, the typed CR-line helpers used by
//! every text protocol in the grid, and the binary configuration
//! envelope codec.

pub mod codec;
pub mod connection;
pub mod text;

pub use codec::{decode_config, encode_config, encode_config_base64};
pub use connection::{ConnStat, Connection, Listener, ReadConn, WriteConn};
