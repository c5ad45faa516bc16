//! Fixed-layout serialization of [`pcx_cpu_core::CpuState`].
//!
//! The byte layout is a compatibility surface: fields are little-endian and always appear in
//! the same order, so a snapshot taken by one build restores exactly in another.

mod cpu;
mod error;
mod io;

pub use crate::cpu::{restore_cpu, save_cpu, CPU_SNAPSHOT_MAGIC, CPU_SNAPSHOT_VERSION};
pub use crate::error::{Result, SnapshotError};
