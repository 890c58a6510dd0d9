pub mod ble;
pub mod body_metrics;
pub mod controller;
pub mod protocol;
pub mod scales;
pub mod simulated;
pub mod system;
pub mod types;

pub use controller::*;
pub use types::*;
