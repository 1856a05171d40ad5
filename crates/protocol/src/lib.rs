pub mod address;
pub mod config;
pub mod frame;
pub mod messages;

pub use address::*;
pub use config::*;
pub use frame::*;
pub use messages::*;
