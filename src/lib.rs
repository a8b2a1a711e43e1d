pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod hashing;
pub mod image;
pub mod logging;
pub mod pipeline;
pub mod position;
pub mod recorder;
pub mod report;
pub mod sbuf;
pub mod scanner;
pub mod util;
