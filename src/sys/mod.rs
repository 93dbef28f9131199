//! Raw OS glue: the pieces spec.md treats as injectable/external
//! collaborators (the poll primitive, the eventfd-backed wakeup counter)
//! get a concrete Linux implementation here so the crate is usable out of
//! the box, while [`crate::Context::set_poll_function`] lets an embedder
//! swap the poll primitive for another OS's equivalent.

pub mod eventfd;
pub mod fd;
pub mod poll;
