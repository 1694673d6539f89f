pub mod codec;
pub mod events;
pub mod models;
pub mod persistence;
pub mod ports;
pub mod service;
pub mod store;
