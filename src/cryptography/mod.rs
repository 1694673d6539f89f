pub mod keys;
pub mod memlock;
pub mod primitives;
pub mod types;
pub mod verifier;
