//! Tipflow Settlement Backend Library
//!
//! Exposes the payment, evaluation and settlement modules for use by the
//! server binary and integration tests.

pub mod api;
pub mod evaluation;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod schedulers;
pub mod store;
pub mod webhook;
