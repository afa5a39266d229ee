pub mod merge;
pub mod models;
