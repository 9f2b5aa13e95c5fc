pub mod clients;
pub mod errors;
pub mod logging;

pub use errors::{GatewayError, GatewayResult};
