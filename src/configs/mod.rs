pub mod endpoint_config;
pub mod session_config;
