//! # Strata HAL - Platform Abstraction Layer
//!
//! This crate defines the traits and primitives through which the mid-layer
//! reaches its surrounding execution environment. All platform-specific
//! implementations (bare-metal ports, hosted test harnesses) implement these
//! traits.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Complete**: Abstracts every environment service the mid-layer needs
//! - **Minimal**: Only exposes what's necessary
//! - **Safe**: Encapsulates all unsafe operations
//! - **Extensible**: New platforms can be added easily

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod percpu;
pub mod platform;
pub mod stub;
pub mod sync;

pub use percpu::PerCpu;
pub use platform::{
    DeferredWork, IrqFlags, IrqGuard, Nanoseconds, Platform, ProcessorId, TimerHandle,
};
pub use stub::StubPlatform;
pub use sync::{Completion, NonReentrant, NonReentrantGuard};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// The referenced processor does not exist
    InvalidProcessor,
    /// Feature not initialized
    NotInitialized,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HalError::NotSupported => write!(f, "operation not supported"),
            HalError::InvalidParameter => write!(f, "invalid parameter"),
            HalError::InvalidProcessor => write!(f, "invalid processor"),
            HalError::NotInitialized => write!(f, "not initialized"),
        }
    }
}
