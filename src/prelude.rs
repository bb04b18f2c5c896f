pub use crate::errors::{Error, Result};
pub use crate::sched::prelude::*;
pub use crate::utils::prelude::*;
