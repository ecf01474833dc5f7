pub mod throttle;
pub mod transmit;
