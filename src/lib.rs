pub mod config;
pub mod engine;
pub mod error;
pub mod log;
pub mod model;
pub mod output;
pub mod producer;
pub mod reference;
pub mod simulator;
pub mod streams;
pub mod topics;
