pub mod args;
pub mod config;
mod parse;
pub mod wait;
