pub mod alloc;
pub mod ops;
pub mod registry;
pub mod runner;

use crate::Result;

/// Operations a run loop drives for objects of type `T`.
///
/// Failed calls are retried by the caller, so `update` and `delete` must be
/// safe to repeat from the top after any error.
pub trait Operations<T> {
    fn update(&self, obj: &T) -> Result<()>;
    fn delete(&self, obj: &T) -> Result<()>;
    /// Removes everything not accounted for by the tracked objects. `live`
    /// yields the objects the caller currently considers desired.
    fn prune(&self, live: &mut dyn Iterator<Item = &T>) -> Result<()>;
}
