//! Structured-concurrency helpers. Kept from the teacher as in-workspace
//! reference for bounded task-group spawning; the DAG executor itself
//! uses `futures::stream::FuturesUnordered` directly (see `dag.rs`)
//! since it needs to react to the single earliest-finishing step rather
//! than a fixed group, which `Nursery` does not expose.

pub mod nursery;

pub use nursery::{Nursery, NurseryScope};
