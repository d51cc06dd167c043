// Download module - coordinates all transfer operations

pub mod checksum;
mod coordinator;
mod fetch;

pub use coordinator::Coordinator;
