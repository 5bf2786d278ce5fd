pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod form;
pub mod inference;
pub mod summary;
