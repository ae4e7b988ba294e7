pub mod app;
pub mod config;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod shell;
pub mod telemetry;
pub mod transport;

pub use config::Config;

pub use a2a_wire as wire;
