//! Contract surface shared between the keel host and its plugins.
//!
//! Everything in this crate lives in the `keel.api` symbol namespace. The host
//! resolves these names for every plugin, so a plugin can never substitute its
//! own copy of the contract:
//!
//! - [`PluginEntryPoint`]: the two-method lifecycle contract every plugin exposes
//! - [`PluginDescriptor`]: what a configured plugin contributes (tools, system messages)
//! - [`Tool`]: a callable tool with a declared [`ToolSchema`]
//!
//! # Symbol names
//!
//! The constants [`ENTRY_POINT_CONTRACT`] and [`TOOL_CONTRACT`] are the
//! fully-qualified names plugin modules declare when they implement the
//! contract.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod descriptor;
pub mod entry_point;
pub mod error;
pub mod schema;
pub mod tool;

pub use descriptor::{PluginDescriptor, PluginDescriptorBuilder};
pub use entry_point::PluginEntryPoint;
pub use error::{ApiError, ApiResult};
pub use schema::{SchemaProperty, SchemaType, ToolSchema};
pub use tool::Tool;

/// Namespace prefix of every contract symbol.
pub const CONTRACT_NAMESPACE: &str = "keel.api";

/// Fully-qualified symbol name of the [`PluginEntryPoint`] contract.
pub const ENTRY_POINT_CONTRACT: &str = "keel.api.PluginEntryPoint";

/// Fully-qualified symbol name of the [`Tool`] contract.
pub const TOOL_CONTRACT: &str = "keel.api.Tool";
