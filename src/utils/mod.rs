//! Commonly used utilities like handles, pools and timestamps.

#[macro_use]
pub mod handle;
pub mod arena;
pub mod handle_pool;
pub mod object_pool;
pub mod time;

pub mod prelude {
    pub use super::arena::Arena;
    pub use super::handle::{Handle, HandleIndex, HandleLike};
    pub use super::handle_pool::HandlePool;
    pub use super::object_pool::ObjectPool;
    pub use super::time::Timestamp;
}
