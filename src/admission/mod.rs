//! 准入 / 去重：调用指纹与带窗口的历史表

pub mod controller;
pub mod fingerprint;

pub use controller::{AdmissionController, AdmissionDecision, AdmissionPolicy, BlockReason};
pub use fingerprint::Fingerprint;
