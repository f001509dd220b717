//! Access control for tunnels
//!
//! Password hashing, IP allow-lists and brute-force rate limiting.

pub mod ip_filter;
pub mod password;
pub mod rate_limit;

pub use ip_filter::{is_allowed, normalize_ip, parse_allow_list, IpFilter, IpFilterError};
pub use password::{
    hash_password, hash_password_with, verify_password, HashParams, PasswordError,
};
pub use rate_limit::{AttemptPermit, RateLimitConfig, RateLimitStatus, RateLimiter, BUSY_RETRY};
