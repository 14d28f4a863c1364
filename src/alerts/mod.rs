pub mod aggregator;
pub mod noise;
pub mod types;
