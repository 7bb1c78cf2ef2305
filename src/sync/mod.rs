//! Cooperative scheduling primitives: pause flag, linked cancellation, and a
//! runtime-resizable semaphore.

mod cancel;
mod pause;
mod semaphore;

pub use cancel::LinkedToken;
pub use pause::PauseToken;
pub use semaphore::{DynamicPermit, DynamicSemaphore};
