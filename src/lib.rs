pub mod classify;
pub mod cli;
pub mod error;
pub mod model;
pub mod parsers;
pub mod service;
pub mod store;
