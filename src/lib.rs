pub mod config;
pub mod database;
pub mod encoder;
pub mod ledger;
pub mod models;
pub mod messaging;
pub mod routes;
pub mod service;
pub mod storage;
pub mod transcode;
pub mod worker;
pub mod worker_scheduler;
pub mod worker_processing;
