pub mod controller;
pub mod fleet;
pub mod metrics;
pub mod watchdog;

pub use controller::{AutoscaleController, HoldReason, ScaleReason, ScalingDecision, StepPolicy};
pub use fleet::{Fleet, FleetRegistry, ScaleSource};
pub use metrics::{run_metrics_feed, FleetMetrics, MetricsCollector, WaitSampler};
pub use watchdog::ScaleToZeroWatchdog;
