// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod http_gateway;
pub mod view_stream;
pub mod ws_live_stream;
