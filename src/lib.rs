pub mod audit;
pub mod config;
pub mod errors;
pub mod lock;
pub mod op;
pub mod queue;
pub mod session;
pub mod status;
pub mod store;
pub mod tracker;
pub mod worker;
pub mod workspace;
