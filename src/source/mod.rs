// Capture backends behind the SessionProvider boundary.

pub mod http_source;
pub mod traits;
