//! Control a single `ptrace(2)` tracee from any thread.
//!
//! Linux only accepts ptrace requests for a tracee from the one thread that became its
//! tracer. A [`Tracee`] owns such a thread and funnels every request through it, while a
//! second thread turns `waitpid(2)` status changes into a stream of [`Event`]s.

#[macro_use]
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod tracee;
pub mod tracer;

mod cmd;
mod executor;
mod wait;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
mod x86;

pub use error::{Error, Result};
pub use event::Event;
pub use lifecycle::Stage;
pub use tracee::{Pid, Registers, Restart, Siginfo, Signal, Tracee};
pub use tracer::Tracer;
