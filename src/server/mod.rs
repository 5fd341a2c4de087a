pub mod handler;

pub use handler::{router, ApiServer};
