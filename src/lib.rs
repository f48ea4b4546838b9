//! pybridge
//!
//! Embeds CPython and exposes its objects to a host through reference-counted
//! handles, with isolated sub-interpreter contexts, a per-context execution
//! lock and synchronous or asynchronous call/exec operations.
//!
//! ```no_run
//! use pybridge::{Bridge, BridgeConfig, ForeignTarget, HostValue};
//!
//! # fn main() -> Result<(), pybridge::BridgeError> {
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! let context = bridge.create_context()?;
//! let math = bridge.acquire_foreign(ForeignTarget::Module("math"), Some(&context))?;
//! let root = bridge.invoke(&math, "sqrt", &[HostValue::Number(16.0)], None, Some(&context))?;
//! assert_eq!(root, HostValue::Number(4.0));
//! bridge.destroy_context(&context)?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;

pub use bridge::{
    is_running, Bridge, BridgeConfig, BridgeError, ContextHandle, ContextTag, ForeignHandle,
    ForeignTarget, HostArray, HostObject, HostValue, Member, OpaqueValue, PendingCall, Session,
    SourceMode,
};
