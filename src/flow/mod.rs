//! Declarative spec schema.
//!
//! Specs are YAML or JSON documents with a top-level `kind`:
//! - `component`: typed inputs/outputs and a run block
//! - `operation`: an invocation of a component with params and overrides
//! - `compiled_operation`: the fully resolved form

mod compiled;
mod component;
mod environment;
mod init;
mod io;
mod lifecycle;
mod matrix;
mod operation;
mod plugins;
mod reader;
mod refs;
mod run;

pub use compiled::CompiledOperation;
pub use component::Component;
pub use environment::{Environment, Termination, TerminationSpec};
pub use init::{ArtifactsInit, DockerfileInit, FileInit, Init, InitDirective, TensorboardInit};
pub use io::{is_template, validate_io_list, Io, Param, RESERVED_NAMES};
pub use lifecycle::{
    Build, Cache, CronSchedule, DatetimeSchedule, EarlyStopping, EventKind, EventTrigger,
    FailureEarlyStopping, Hook, HookTrigger, IntervalSchedule, Join, MetricEarlyStopping,
    Optimization, Schedule, TriggerPolicy,
};
pub use matrix::{
    DateRangeSpec, GridSearch, HpParam, MappingSearch, Matrix, NormalSpec, RandomSearch,
    RangeSpec, SpaceSpec, TunerSearch, UniformSpec,
};
pub use operation::{ComponentSource, Operation, PatchStrategy};
pub use plugins::{Plugins, SidecarOverrides};
pub use reader::{from_value, read_preset, read_spec, read_spec_file, read_value, Spec};
pub use refs::{ContextRef, EntityRef, RefEntity, RefSection};
pub use run::{Dag, DistributedRun, Job, ReplicaSpec, Run, RunKind, Service};
