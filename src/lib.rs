pub mod alerts;
pub mod chain;
pub mod config;
pub mod decode;
pub mod events;
pub mod finality;
pub mod intel;
pub mod pipeline;
pub mod rpc;
pub mod rules;
