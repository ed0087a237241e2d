//! Workflow execution engine: handler registry, single-run stepper, and the
//! async dispatcher that drives runs on a bounded worker pool.

pub mod dispatcher;
pub mod handlers;
pub mod stepper;

pub use dispatcher::{recover_stranded_runs, sweep_expired_gates, Dispatcher, DispatcherHandle};
pub use handlers::HandlerRegistry;
pub use stepper::{RunOutcome, StepOutcome, Stepper};
