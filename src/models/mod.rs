pub mod account;
pub mod generation;
pub mod thumbnail;
