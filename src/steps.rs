//! Built-in step implementations for the CLI.

use futures::future::BoxFuture;
use serde_json::json;

use taskweave_core::error::Result;
use taskweave_core::traits::Step;
use taskweave_core::types::{ParamSpec, StepSpec};
use taskweave_workflow::StepRegistry;

/// Registry with the built-in step kinds: `constant`, `template`, and
/// `delay`.
pub fn builtin_registry() -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    registry.register(ConstantStep)?;
    registry.register(TemplateStep)?;
    registry.register(DelayStep)?;
    Ok(registry)
}

/// Returns its own parameters as output. Useful as a source node whose
/// fields downstream nodes reference.
struct ConstantStep;

impl Step for ConstantStep {
    fn name(&self) -> &str {
        "constant"
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
    }

    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move { Ok(params) })
    }
}

/// Emits its `text` parameter, which upstream references have already
/// been substituted into.
struct TemplateStep;

impl Step for TemplateStep {
    fn name(&self) -> &str {
        "template"
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new()
            .with_required(ParamSpec::required("text", "text with references resolved"))
            .with_output("text")
    }

    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let text = params
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(json!({ "text": text }))
        })
    }
}

/// Sleeps for `millis`, then passes its parameters through.
struct DelayStep;

impl Step for DelayStep {
    fn name(&self) -> &str {
        "delay"
    }

    fn spec(&self) -> StepSpec {
        StepSpec::new().with_optional(ParamSpec::optional(
            "millis",
            "sleep duration in milliseconds",
            json!(100),
        ))
    }

    fn execute(&self, params: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let millis = params.get("millis").and_then(|v| v.as_u64()).unwrap_or(100);
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            Ok(params)
        })
    }
}
