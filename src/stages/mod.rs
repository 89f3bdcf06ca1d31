//! 阶段层：分诊（triage）、规划（planner）、执行（developer），以及提示词与模型输出解析

pub mod developer;
pub mod parse;
pub mod planner;
pub mod prompts;
pub mod triage;

pub use developer::{ActionType, Artifact, Developer, StepOutcome};
pub use parse::{extract_json, parse_payload};
pub use planner::{summarize_hits, validate_plan, PlanContext, Planner};
pub use prompts::PlanPayload;
pub use triage::{Assessment, Classifier, FALLBACK_COMPLEXITY, FALLBACK_ROUTE};
