//! The five builtin source kinds (spec section 4.7), each a small
//! `SourceImpl` plus a constructor returning an attach-ready `Arc<Source>`.

pub mod child_watch;
pub mod descriptor;
pub mod idle;
pub mod signal_watch;
pub mod timer;

pub use child_watch::ChildWatchSource;
pub use descriptor::DescriptorSource;
pub use idle::IdleSource;
pub use signal_watch::SignalWatchSource;
pub use timer::TimerSource;
