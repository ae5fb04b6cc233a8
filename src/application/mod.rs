// Application layer - Gateway contracts and the session state machine
pub mod gateway;
pub mod live_stream;
pub mod session_clock;
pub mod session_controller;
pub mod session_runtime;

#[cfg(test)]
pub mod testing;
