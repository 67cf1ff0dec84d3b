pub mod auth;
pub mod breaker;
pub mod cache;
pub mod ratelimit;
pub mod routing;
pub mod upstream;
