pub mod bus;
pub mod cec_client;
pub mod config;
pub mod mock_bus;
pub mod motion;
pub mod notifier;
pub mod power;
