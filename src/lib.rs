pub mod alerts;
pub mod anomaly;
pub mod config;
pub mod entity;
pub mod error;
pub mod graph;
pub mod output;
pub mod pipeline;
pub mod rules;
pub mod transactions;
