// Domain layer - Bench entities and pure session rules
pub mod border;
pub mod device;
pub mod message;
pub mod metric;
pub mod range;
pub mod session;
