//! The RADICAL-Pilot in-allocation agent: Resource Manager, Scheduler,
//! Launch-Method registry, Executor, Staging, Update/Control and RAPTOR.

pub mod control;
pub mod env_isolation;
pub mod executor;
pub mod launch;
pub mod pipeline;
pub mod raptor;
pub mod resource_manager;
pub mod sandbox;
pub mod scheduler;
pub mod staging;

