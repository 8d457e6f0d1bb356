//! Network layer for remote backing nodes.
//!
//! - [`rpc`]: length-prefixed bincode frames carrying batched commands.
//! - [`server`]: a TCP server exposing a store over that protocol.
//! - [`client`]: a [`NodeClient`](crate::storage::NodeClient) speaking it.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{TcpConnector, TcpNodeClient};
pub use rpc::{NodeCommand, NodeReply, NodeRequest, NodeResponse, MAX_FRAME_SIZE};
pub use server::{CommandHandler, NodeServer, StoreHandler};
