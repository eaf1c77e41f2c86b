pub mod artifacts;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod embed;
pub mod export;
pub mod model;
pub mod npy;
pub mod pipeline;
pub mod server;
pub mod tsne;
