pub mod cancellation;
pub mod sampling;

pub use cancellation::{CancellationHandle, CancellationToken};
pub use sampling::*;
