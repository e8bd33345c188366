//! The cartolina tile server: configuration, the HTTP delivery surface, the
//! per-tile admission cache, the resource-backend poller and the control
//! plane. The binary in `main.rs` wires these together around the generator
//! registry and the warper farm.

pub mod config;
pub mod ctrl;
pub mod poller;
pub mod server;

pub use config::Config;
pub use server::TileServer;
