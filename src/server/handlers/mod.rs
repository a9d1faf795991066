pub mod admin;
pub mod fragment;
pub mod health;
pub mod metrics;
