pub mod commenter;
pub mod config;
pub mod correction;
pub mod tracker;
