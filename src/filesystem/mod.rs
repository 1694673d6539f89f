pub mod clipboard;
pub mod credentials;
pub mod remote;
pub mod secure;
pub mod store;
