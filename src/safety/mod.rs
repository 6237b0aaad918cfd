pub mod circuit_breaker;
pub mod emergency_stop;
