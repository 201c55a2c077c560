pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod parsers;
pub mod pipeline;
pub mod reader;
pub mod report;
pub mod runner;
pub mod sink;
pub mod uploader;
pub mod watcher;
