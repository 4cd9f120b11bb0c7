//! polyflow - workflow spec compiler and reconcile agent
//!
//! polyflow takes layered YAML/JSON workflow specs (components, operations,
//! presets) and compiles them, pass by pass, into fully resolved operations
//! and then into container-runtime resources. An agent loop reconciles runs
//! between a remote control plane and the runtime.
//!
//! ## Example
//!
//! ```yaml
//! version: 1.1
//! kind: operation
//! params:
//!   lr: {value: 0.1}
//! component:
//!   name: trainer
//!   inputs:
//!     - {name: lr, type: float, isOptional: true, value: 0.01}
//!   run:
//!     kind: job
//!     container:
//!       image: python:3.11
//!       command: [python, train.py]
//!       args: ["{{ params.lr.as_arg }}"]
//! ```

pub mod agent;
pub mod compiler;
pub mod config;
pub mod connections;
pub mod converter;
pub mod dag;
pub mod error;
pub mod flow;
pub mod k8s;
pub mod metrics;
pub mod params;
pub mod parser;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
