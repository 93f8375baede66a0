pub mod attribution;
pub mod bus;
pub mod execution_store;
pub mod log_stream;
pub mod outage;
pub mod persistence;
pub mod poller;
pub mod registry;
