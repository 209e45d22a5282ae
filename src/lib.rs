pub mod api;
pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod manager;
pub mod reaper;
pub mod scheduler;
pub mod store;
