pub mod arithmetic;
pub mod bulk;
pub mod client;
pub mod config;
pub mod daemon;
pub mod distributor;
pub mod error;
pub mod hosts;
pub mod metadata;
pub mod planner;
pub mod rpc;
pub mod storage;
pub mod task;

#[cfg(test)]
mod cluster_tests;
