//! Locate code in a running process by signature and patch it.

pub mod hooks;
pub mod image;
pub mod offsets;
pub mod signatures;

pub use hooks::{HookEngine, HookError, HookKind, Original, Transaction};
pub use image::MemoryRegion;
pub use signatures::{QueryHandle, QueryState, ResolutionReport, SignatureRegistry};
