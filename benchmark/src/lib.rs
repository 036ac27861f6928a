pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod metrics;
pub mod ops;
pub mod pacer;
pub mod payload;
pub mod state;
pub mod workload;
