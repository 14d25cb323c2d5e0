mod handlers;
mod metrics;
pub mod ratelimit;
mod request_id;
mod routes;

pub use handlers::{AppError, GEO_COUNTRY_HEADER, OPERATOR_HEADER};
pub use ratelimit::RateLimiter;
pub use routes::*;
