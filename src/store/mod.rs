mod job;
mod session;

pub use job::{JobStore, PgJobStore};
pub use session::SessionRegistry;
