pub mod analytics;
pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod pacemaker;
pub mod providers;
pub mod service;
pub mod storage;
pub mod ui;
