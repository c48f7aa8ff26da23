pub mod auth;
pub mod client;
pub mod config;
pub mod controllers;
pub mod crypto;
pub mod db_ops;
pub mod errors;
pub mod extractors;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod session;
pub mod storage;
pub mod store;
