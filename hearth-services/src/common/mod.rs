mod timeout;
pub use timeout::TimeoutService;
