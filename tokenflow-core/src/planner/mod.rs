//! Pure planning: every function here maps immutable inputs to a
//! `Plan` of decisions and trace events. No store handles, no clocks, no
//! RPC. The coordinator gathers inputs and dispatch applies outputs,
//! which is what makes routing and synchronization testable without any
//! persistence or concurrency fixtures.

pub mod lifecycle;
pub mod routing;
pub mod synchronization;

pub use lifecycle::{plan_completion, plan_start};
pub use routing::{plan_routing, RoutingInput};
pub use synchronization::{
    plan_arrival, plan_timeout, ArrivalInput, SyncOutcome, SyncPlan, TimeoutInput,
};
