//! Adapters between the federation API payloads and the reconciliation core:
//! the field reconciler that validates cached programs, and the harvester that
//! fills the cache.

pub mod harvest;
pub mod reconcile;

pub use harvest::{
    FederationSource, HarvestError, HarvestPlan, HarvestSummary, Harvester, IgnoredEvent,
};
pub use reconcile::{
    detect_distance, DistanceRule, EventVerdict, FieldReconciler, FieldRules, ProgramVerdict,
    ReconciledEvent, ReconciledProgram, DISTANCE_RULES,
};

pub const CRATE_NAME: &str = "tristat-adapters";
