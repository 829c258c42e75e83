pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod remote;
pub mod server;
pub mod supervisor;
pub mod tools;

#[cfg(test)]
mod testing;
