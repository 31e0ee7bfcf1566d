pub mod app;
pub mod auth;
pub mod chat;
pub mod chat_handlers;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod nonstream;
pub mod store;
pub mod stream;
pub mod tools;
pub mod upstream;
pub mod usage;
