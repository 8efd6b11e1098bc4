#![forbid(unsafe_code)]

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod channel;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod memory_broker;
pub mod policy;
pub mod redis_broker;
pub mod transport;
pub mod ws;
