pub mod clients;
pub mod clock;
pub mod config;
pub mod interrupt;
pub mod monitor;
pub mod pipeline;
pub mod protocol;
pub mod script;
pub mod session;
pub mod state;
