//! Library surface for `retro-server`'s binary and its integration
//! tests. The accept loops, Directory/MessageQueue/CallRoom aggregate,
//! and wire routing all live here; `main.rs` is a thin CLI wrapper
//! around [`server::spawn_listeners`].

pub mod audioserver;
pub mod chat;
pub mod config;
pub mod directory;
pub mod error;
pub mod fileserver;
pub mod msgqueue;
pub mod server;
pub mod session;
pub mod state;
pub mod tls;
pub mod workers;

pub use config::ServerConfig;
pub use state::ServerState;
