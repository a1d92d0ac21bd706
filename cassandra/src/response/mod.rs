//! Results of executed requests.

pub mod query_result;

pub use query_result::QueryResult;
