pub mod data_stream;
pub mod ping_pong;
pub mod quota_backpressure;
pub mod remote_loopback;
pub mod snapshot;
