pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod lsh;
pub mod matrix;
pub mod output;
pub mod pairs;
pub mod sets;
pub mod similarity;
pub mod store;
pub mod table;
