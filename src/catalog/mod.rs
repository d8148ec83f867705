//! In-memory catalog: databases, collections and their indexes

pub mod collection;
pub mod database;
pub mod namespace;
