/*
 * Sample Criterion implementations.
 *
 * These are reference policies, not the only valid ones: any type
 * implementing `crate::criterion::Criterion` can be plugged into
 * `Platform::Criterion`, per the build-time-selected-policy design in
 * `criterion.rs`.
 */

pub mod dynamic_demo;
pub mod fcfs;
pub mod priority;

pub use dynamic_demo::DynamicDemo;
pub use fcfs::Fcfs;
pub use priority::Priority;
