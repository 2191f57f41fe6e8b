pub mod models;
pub mod error;
pub mod carrier;
pub mod clock;
pub mod services;
pub mod handlers;
pub mod router;

pub use models::*;
pub use error::*;
pub use carrier::*;
pub use clock::{Clock, SystemClock};
pub use services::*;
pub use router::create_status_router;
