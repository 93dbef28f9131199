//! A reusable event-loop core.
//!
//! [`Context`] owns a table of [`Source`]s and drives them through a
//! priority-ordered prepare/query/poll/check/dispatch pipeline; [`Loop`]
//! is a thin run/quit wrapper around a context. Five builtin source kinds
//! live in [`sources`]: timers, idle callbacks, descriptor readiness,
//! child-process termination and Unix signal notifications.
//!
//! ```no_run
//! use eventcore::{Context, Loop};
//! use eventcore::sources::IdleSource;
//! use eventcore::source::DispatchAction;
//!
//! let context = Context::new().unwrap();
//! let main_loop = Loop::new(context.clone());
//!
//! let loop_handle = main_loop.clone();
//! let idle = IdleSource::new(move || {
//!     loop_handle.quit();
//!     DispatchAction::Remove
//! });
//! idle.attach(&context);
//!
//! main_loop.run();
//! ```

pub mod clock;
pub mod context;
pub mod main_loop;
mod poll_set;
pub mod ready;
pub mod source;
pub mod sources;
pub mod sys;
mod wakeup;

pub use context::Context;
pub use main_loop::Loop;
pub use ready::Ready;
pub use source::Source;
pub use wakeup::Wakeup;
