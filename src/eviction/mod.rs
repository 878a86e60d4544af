pub mod score;
pub mod strategy;

pub use strategy::{strategy_for, EvictionStrategy, LruEviction, ManualEviction, TimeoutEviction};
