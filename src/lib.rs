pub mod config;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod sink;
