//! Thumbnail generation service
//!
//! Requests are admitted synchronously over HTTP, queued in Redis with a
//! priority derived from the owner's plan, and rendered asynchronously by a
//! pool of workers against the Gemini image models. Finished images are
//! stored in R2, and owners are charged credits only once a result is durably
//! committed.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
