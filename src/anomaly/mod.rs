pub mod surge;
pub mod types;
