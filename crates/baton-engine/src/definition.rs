//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML documents and the canonical `WorkflowDefinition`
//! IR and validates the structural invariants the engine relies on:
//! unique step ids per nesting level, defined agent references, nesting
//! rules for foreach/loop/parallel, iteration bounds, and the template
//! injection guard on condition expressions.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use baton_types::error::ValidationError;
use baton_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum parallel nesting depth.
pub const MAX_PARALLEL_DEPTH: usize = 5;

/// Minimum explicit loop timeout; `0` still means "inherit" at execution.
pub const MIN_LOOP_TIMEOUT_SECS: u64 = 2;

/// Inclusive bounds for `max_iterations`.
pub const MIN_LOOP_ITERATIONS: u32 = 1;
pub const MAX_LOOP_ITERATIONS: u32 = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from definition parsing or file I/O.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let definition: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|err| DefinitionError::Parse(err.to_string()))?;
    validate_definition(&definition)?;
    Ok(definition)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(
    definition: &WorkflowDefinition,
) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(definition).map_err(|err| DefinitionError::Parse(err.to_string()))
}

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file, creating parent directories.
pub fn save_workflow_file(
    path: &Path,
    definition: &WorkflowDefinition,
) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow_yaml(definition)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the structural invariants of a definition. Definitions are
/// immutable after this pass succeeds.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    if definition.name.is_empty() {
        return Err(ValidationError::new("name", "workflow name must not be empty"));
    }
    if definition.steps.is_empty() {
        return Err(ValidationError::new(
            "steps",
            "workflow must have at least one step",
        ));
    }
    for (index, input) in definition.inputs.iter().enumerate() {
        if input.name.is_empty() {
            return Err(ValidationError::new(
                format!("inputs[{index}].name"),
                "input name must not be empty",
            ));
        }
    }

    // Fallback references are dispatched by the runner from the top-level
    // step list, so they must name top-level steps.
    let top_level_ids: HashSet<&str> = definition
        .steps
        .iter()
        .map(|step| step.id.as_str())
        .collect();
    for step in &definition.steps {
        if let Some(policy) = &step.on_error {
            if let Some(fallback_id) = &policy.fallback_step_id {
                if !top_level_ids.contains(fallback_id.as_str()) {
                    return Err(ValidationError::new(
                        format!("steps.{}.on_error.fallback_step_id", step.id),
                        format!("fallback step '{fallback_id}' is not a top-level step"),
                    ));
                }
            }
        }
    }

    let state = WalkState {
        parallel_depth: 0,
        in_foreach: false,
    };
    validate_steps(&definition.steps, "steps", definition, state)
}

#[derive(Clone, Copy)]
struct WalkState {
    parallel_depth: usize,
    in_foreach: bool,
}

fn validate_steps(
    steps: &[StepDefinition],
    field: &str,
    definition: &WorkflowDefinition,
    state: WalkState,
) -> Result<(), ValidationError> {
    let mut seen_ids = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        let path = format!("{field}[{index}]");
        if step.id.is_empty() {
            return Err(ValidationError::new(
                format!("{path}.id"),
                "step id must not be empty",
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::new(
                format!("{path}.id"),
                format!("duplicate step ID '{}' within its step list", step.id),
            )
            .with_suggestion("step ids must be unique within their containing list"));
        }

        // Injection guard: expression strings are evaluated, never
        // template-substituted, so template markers inside them are
        // rejected outright.
        if let Some(condition) = &step.condition {
            if condition.expression.contains("{{") || condition.expression.contains("}}") {
                return Err(ValidationError::new(
                    format!("{path}.condition.expression"),
                    "condition expressions must not contain template markers",
                )
                .with_suggestion("reference context values as dotted paths, e.g. steps.x.response"));
            }
            if condition.expression.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{path}.condition.expression"),
                    "condition expression must not be empty",
                ));
            }
        }

        if let Some(permissions) = &step.permissions {
            let patterns = permissions
                .paths
                .iter()
                .chain(&permissions.hosts)
                .chain(&permissions.tools);
            for pattern in patterns {
                if pattern.is_empty() {
                    return Err(ValidationError::new(
                        format!("{path}.permissions"),
                        "permission patterns must not be empty",
                    ));
                }
            }
        }

        match &step.config {
            StepConfig::Llm { .. } => {}
            StepConfig::Integration {
                integration,
                action,
                operation,
                ..
            } => {
                // Shape check only; resolution against the runtime
                // registry is deferred to execution.
                let well_formed = match (integration, action, operation) {
                    (Some(reference), _, _) => reference.contains('.'),
                    (None, Some(_), Some(_)) => true,
                    _ => false,
                };
                if !well_formed {
                    return Err(ValidationError::new(
                        format!("{path}.integration"),
                        "integration step requires `integration: \"name.operation\"` or `action` + `operation`",
                    ));
                }
            }
            StepConfig::Agent { agent, .. } => {
                if !definition.agents.contains_key(agent) {
                    return Err(ValidationError::new(
                        format!("{path}.agent"),
                        format!("agent '{agent}' is not defined"),
                    )
                    .with_suggestion("declare the agent under the workflow's `agents` map"));
                }
            }
            StepConfig::Condition {
                then_steps,
                else_steps,
            } => {
                if step.condition.is_none() {
                    return Err(ValidationError::new(
                        format!("{path}.condition"),
                        "condition step requires condition.expression",
                    ));
                }
                validate_steps(
                    then_steps,
                    &format!("{path}.then_steps"),
                    definition,
                    state,
                )?;
                validate_steps(
                    else_steps,
                    &format!("{path}.else_steps"),
                    definition,
                    state,
                )?;
            }
            StepConfig::Parallel { steps, foreach, .. } => {
                let depth = state.parallel_depth + 1;
                if depth > MAX_PARALLEL_DEPTH {
                    return Err(ValidationError::new(
                        format!("{path}"),
                        format!("parallel nesting depth exceeds maximum {MAX_PARALLEL_DEPTH}"),
                    ));
                }
                if foreach.is_some() && state.in_foreach {
                    return Err(ValidationError::new(
                        format!("{path}.foreach"),
                        "foreach must not nest inside another foreach",
                    ));
                }
                let nested_state = WalkState {
                    parallel_depth: depth,
                    in_foreach: state.in_foreach || foreach.is_some(),
                };
                validate_steps(steps, &format!("{path}.steps"), definition, nested_state)?;
            }
            StepConfig::Loop {
                steps,
                max_iterations,
                ..
            } => {
                if *max_iterations < MIN_LOOP_ITERATIONS || *max_iterations > MAX_LOOP_ITERATIONS {
                    return Err(ValidationError::new(
                        format!("{path}.max_iterations"),
                        format!(
                            "max_iterations must be between {MIN_LOOP_ITERATIONS} and {MAX_LOOP_ITERATIONS}"
                        ),
                    ));
                }
                // A positive timeout below the floor starves the loop's
                // own deadline checks; 0 still means "inherit".
                if let Some(timeout) = step.timeout {
                    if timeout > 0 && timeout < MIN_LOOP_TIMEOUT_SECS {
                        return Err(ValidationError::new(
                            format!("{path}.timeout"),
                            format!("loop timeout must be at least {MIN_LOOP_TIMEOUT_SECS} seconds"),
                        ));
                    }
                }
                if steps
                    .iter()
                    .any(|nested| matches!(nested.config, StepConfig::Loop { .. }))
                {
                    return Err(ValidationError::new(
                        format!("{path}.steps"),
                        "a loop must not nest directly inside another loop",
                    ));
                }
                validate_steps(steps, &format!("{path}.steps"), definition, state)?;
            }
            StepConfig::Workflow { workflow, .. } => {
                if workflow.is_empty() {
                    return Err(ValidationError::new(
                        format!("{path}.workflow"),
                        "workflow path must not be empty",
                    ));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Input reconciliation
// ---------------------------------------------------------------------------

/// Reconcile caller-supplied inputs with the declared inputs: missing
/// values are filled from defaults, a missing value with no default is a
/// validation error, and enum constraints are enforced. Undeclared inputs
/// pass through untouched.
pub fn reconcile_inputs(
    definition: &WorkflowDefinition,
    supplied: serde_json::Map<String, Value>,
) -> Result<serde_json::Map<String, Value>, ValidationError> {
    let mut inputs = supplied;
    for declaration in &definition.inputs {
        match inputs.get(&declaration.name) {
            None => match &declaration.default {
                Some(default) => {
                    inputs.insert(declaration.name.clone(), default.clone());
                }
                None => {
                    return Err(ValidationError::new(
                        format!("inputs.{}", declaration.name),
                        "required input is missing and has no default",
                    )
                    .with_suggestion(format!(
                        "pass `{}` when invoking workflow '{}'",
                        declaration.name, definition.name
                    )));
                }
            },
            Some(value) => {
                if let Some(allowed) = &declaration.allowed {
                    if !allowed.contains(value) {
                        return Err(ValidationError::new(
                            format!("inputs.{}", declaration.name),
                            format!("value {value} is not one of the allowed values"),
                        ));
                    }
                }
            }
        }
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
