pub mod copy_engine;
pub mod position_sizer;
pub mod risk_manager;

pub use copy_engine::{
    run_copy_engine, CopyEngine, CopyEngineConfig, MasterWorkers, RelationshipReport, ReplicationOutcome, SkipReason,
};
