pub mod accrual;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod luhn;
pub mod server;
pub mod service;
pub mod state;
pub mod storage;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
