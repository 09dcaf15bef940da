//! Request-side authentication helpers: the refresh cookie, bearer access
//! tokens, and client address extraction.

mod cookie;
mod extractors;
mod ip;

pub use cookie::{REFRESH_COOKIE_NAME, clear_refresh_cookie, get_cookie, refresh_cookie};
pub use extractors::{ClientIp, bearer_token};
pub use ip::{HasHeadersAndExtensions, IpSource, extract_client_ip};
