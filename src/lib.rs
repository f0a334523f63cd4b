pub mod config;
pub mod directory;
pub mod error;
pub mod intake;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod producer;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod tracker;
pub mod wal;
pub mod worker;
