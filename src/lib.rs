//! Reference counted blocks with release callbacks, and intrusive lists over them, all living
//! within an array.
//!
//! A [`Pool`] hands out [`Mem`] handles: cloning one acquires a reference, dropping one releases
//! it, and the block's [`Destructor`] runs when the last reference goes. A [`List`] threads the
//! [`Link`] embedded in each object, never allocating, and [`List::flush`] gives back the
//! references membership holds.

#![warn(clippy::pedantic)]

mod error;
pub use error::*;

mod list;
pub use list::*;

#[cfg(feature = "repr_c")]
mod mutex;
#[cfg(feature = "repr_c")]
pub use mutex::*;

mod pool;
pub use pool::*;
