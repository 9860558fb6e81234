pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod paths;
pub mod repository;
pub mod services;
pub mod storage;
pub mod worker;
