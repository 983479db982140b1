pub mod admin;
pub mod core;
pub mod questions;
pub mod reports;
pub mod reviews;
pub mod terms;
