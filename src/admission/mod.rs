//! Per-key fixed-window admission control.

mod bucket;
mod clock;
mod controller;
mod decision;
mod key;
mod policy;
mod sweeper;

pub use bucket::Bucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{AdmissionController, ControllerOptions};
pub use decision::{Decision, STATUS_OK, STATUS_TOO_MANY_REQUESTS};
pub use key::AdmissionKey;
pub use policy::{
    Policy, PolicyFile, PolicyTable, RouteRule, RuleConfig, TimeUnit, DEFAULT_LIMIT,
    DEFAULT_WINDOW_MS,
};
pub use sweeper::{spawn_sweeper, SweeperHandle};
