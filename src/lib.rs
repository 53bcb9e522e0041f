//! dctide
//!
//! Core of a Direct Connect client: hub sessions speaking both the
//! legacy `|`-framed and the modern newline-framed dialect, direct
//! client-to-client upload sessions with slot admission, an in-memory
//! shared file tree with TTH indexing and XML file lists, and the
//! delimiter-framed transport underneath them.
//!
//! # Module structure
//!
//! - `client/`: Public interface (Client, Runtime, config, events)
//! - `hub/`: Hub sessions, one per connection, both dialects
//! - `cc/`: Direct peer connections and slot admission
//! - `share/`: The shared file tree, search, file lists
//! - `net/`: Delimiter-framed duplex transport
//! - `data/`: SQLite persistence with a write-behind queue
//! - `charset`, `tth`: Encoding bridges and digest wire forms
//!
//! # Quick start
//!
//! ```ignore
//! use dctide::{Client, Config, HubConfig};
//!
//! let config = Config::new("mynick")
//!     .with_hub("hub", HubConfig::new("dchub://example.org:411/"));
//! let (client, mut events) = Client::start(config)?;
//! client.hub_open("hub")?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod cc;
pub mod charset;
pub mod client;
pub mod data;
pub mod hub;
pub mod net;
pub mod share;
pub mod tth;

pub use client::{
    Client, ClientError, Config, HubConfig, HubId, Priority, Runtime, TlsPolicy, UiEvent,
};
pub use hub::{HubCtl, HubSession};
pub use share::{FileNode, FileTree, SearchQuery};
