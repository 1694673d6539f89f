pub mod cancel;
pub mod engine;
pub mod remote;
pub mod worker;
