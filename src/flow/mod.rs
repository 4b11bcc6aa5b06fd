//! Flow document model and YAML loading.

mod loader;
mod types;

pub use loader::{load_flows, parse_flow, parse_flow_file};
pub use types::{
    FieldDef, FlowDef, FlowResult, FlowStatus, RetryDef, SchemaDef, StepDef, StepResult,
    StepStatus, TriggerDef,
};
