pub mod cloud;
pub mod config;
pub mod devices;
pub mod link;
pub mod logging;
pub mod sampler;

pub use config::LinkConfig;
pub use link::CloudLink;
