pub mod atomic_writer;
pub mod catalog;
pub mod config;
pub mod merge;
pub mod runtime;
pub mod split;
pub mod table;
