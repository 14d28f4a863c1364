pub mod anomaly;
pub mod profiler;
