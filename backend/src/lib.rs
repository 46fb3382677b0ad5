pub mod config;
pub mod gate;
pub mod imaging;
pub mod inference;
pub mod pipeline;
pub mod report;
pub mod routes;
