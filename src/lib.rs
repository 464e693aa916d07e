pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod imap;
pub mod ingest;
pub mod parse;
pub mod poller;
pub mod scheduler;
pub mod storage;
pub mod threading;
pub mod types;
