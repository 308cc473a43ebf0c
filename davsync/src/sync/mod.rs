#[cfg(test)]
pub(crate) mod fake;
pub mod gate;
pub mod index;
pub mod materialize;
pub mod paths;
pub mod queue;
pub mod reconcile;
pub mod transfer;
