pub mod client;

pub use client::{CoordinatorClientPool, CoordinatorError};
