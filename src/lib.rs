pub mod acquire;
pub mod app;
pub mod classify;
pub mod config;
pub mod domain;
pub mod error;
pub mod fastq;
pub mod fs_util;
pub mod layout;
pub mod ledger;
pub mod manifest;
pub mod output;
pub mod pool;
pub mod sample;
pub mod tools;
