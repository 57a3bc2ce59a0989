pub mod config;
pub mod db;
pub mod gateway;
pub mod import;
pub mod model;
pub mod normalizer;
pub mod outbox;
pub mod search;
pub mod session;
pub mod sync;
