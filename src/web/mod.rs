pub mod account;
pub mod auth;
pub mod chat;
pub mod files;
pub mod history;
pub mod payments;
