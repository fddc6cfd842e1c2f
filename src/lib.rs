pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod fs_util;
pub mod jobs;
pub mod output;
pub mod registry;
pub mod store;
pub mod tiles;
