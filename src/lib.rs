pub mod cli;
pub mod config;
pub mod error;
pub mod explorer;
pub mod fiat;
pub mod fiat_server;
pub mod keys;
pub mod store;
pub mod transaction;
pub mod types;
pub mod wallet;
