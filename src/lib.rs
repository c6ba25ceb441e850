//! osbroker - Open Service Broker with pluggable service modules
//!
//! Implements the Open Service Broker v2 protocol over HTTP. Provisioning,
//! updating and deprovisioning run asynchronously as step workflows supplied
//! by service modules; binding and unbinding are synchronous.
//!
//! # Architecture
//!
//! - Every instance and binding is persisted as an encrypted record
//! - Protocol handlers are idempotent: repeating a request with the same
//!   inputs yields the same answer, different inputs conflict
//! - Workflows persist details after every step so they can resume
//!
//! # Modules
//!
//! - `api`: HTTP routes, basic auth and response mapping
//! - `core`: Lifecycle handlers, async engine and broker composition
//! - `service`: Module traits, catalog and workflows
//! - `services`: Bundled service modules
//! - `storage`: Store trait with memory and redis backends
//! - `crypto`: Record codecs (NOOP, AES256)
//! - `domain`: Instances, bindings and parameters
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the broker
//! osbroker serve --config .osb/config.yaml
//!
//! # Print the catalog
//! osbroker catalog
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod domain;
pub mod service;
pub mod services;
pub mod storage;

// Re-export main types at crate root for convenience
pub use core::{Broker, Lifecycle};
pub use domain::{Binding, BindingStatus, Instance, InstanceStatus};
pub use service::{Catalog, Module, ServiceManager};
pub use storage::Store;
