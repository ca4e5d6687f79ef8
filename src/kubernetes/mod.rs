//! Shared helpers for interacting with the cluster API

pub mod drain;
pub mod labels;
pub mod node;
