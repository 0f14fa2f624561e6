pub mod agent;
pub mod config_cmd;
pub mod conversations;
pub mod models;
