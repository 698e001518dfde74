//! The fixed demo-generation stage sequence and its boundary contracts.
//!
//! The sequence is a deploy-time constant. Each boundary is documented as a
//! [`StageContract`]: which keys a stage needs from its predecessors and
//! which keys it leaves behind for its successors.
//!
//! [`SimulatedStage`] honours a contract without calling any external
//! service. It backs the `simulate` command and the test-suite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::StageError;

use super::stage::{Stage, StageContract};
use super::state::PipelineState;

/// Stage names in execution order.
pub const DEFAULT_STAGE_SEQUENCE: [&str; 7] = [
    "research",
    "narrative",
    "modeling",
    "data_synthesis",
    "provisioning",
    "instructions",
    "validation",
];

/// Seed key every run starts from.
pub const CUSTOMER_URL_KEY: &str = "customer_url";

/// Optional rich-context keys accepted by the first stage.
pub const CONTEXT_KEYS: [&str; 4] = [
    "industry_hint",
    "use_cases",
    "target_audience",
    "additional_context",
];

/// Returns the boundary contract for a stage of the default sequence, or
/// `None` for an unknown name.
pub fn default_contract(stage: &str) -> Option<StageContract> {
    let contract = match stage {
        "research" => StageContract::new(stage)
            .requires(&[CUSTOMER_URL_KEY])
            .optional(&CONTEXT_KEYS)
            .produces(&["company_name", "industry", "research_summary"]),
        "narrative" => StageContract::new(stage)
            .requires(&["company_name", "research_summary"])
            .optional(&["use_cases", "target_audience"])
            .produces(&["demo_title", "demo_story", "golden_queries"]),
        "modeling" => StageContract::new(stage)
            .requires(&["demo_story"])
            .optional(&["golden_queries"])
            .produces(&["schema"]),
        "data_synthesis" => StageContract::new(stage)
            .requires(&["schema"])
            .produces(&["synthetic_data_files"]),
        "provisioning" => StageContract::new(stage)
            .requires(&["schema", "synthetic_data_files"])
            .produces(&["dataset_id", "table_names"]),
        "instructions" => StageContract::new(stage)
            .requires(&["demo_story", "dataset_id"])
            .optional(&["golden_queries", "table_names"])
            .produces(&["demo_instructions"]),
        "validation" => StageContract::new(stage)
            .requires(&["dataset_id", "golden_queries"])
            .produces(&["validation_report"]),
        _ => return None,
    };
    Some(contract)
}

/// Contracts for the whole default sequence, in order.
pub fn default_contracts() -> Vec<StageContract> {
    DEFAULT_STAGE_SEQUENCE
        .iter()
        .filter_map(|name| default_contract(name))
        .collect()
}

/// Contract for an arbitrary stage name: the default contract when known,
/// otherwise a contract producing a single `<name>_output` key.
pub fn contract_for(stage: &str) -> StageContract {
    default_contract(stage).unwrap_or_else(|| {
        let mut contract = StageContract::new(stage);
        contract.produces.push(format!("{}_output", stage));
        contract
    })
}

/// A deterministic stand-in for a real stage.
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    contract: StageContract,
    delay: Duration,
    failure: Option<String>,
    timeout: Option<Duration>,
}

impl SimulatedStage {
    /// Creates a simulated stage for the given contract.
    pub fn new(contract: StageContract) -> Self {
        Self {
            contract,
            delay: Duration::ZERO,
            failure: None,
            timeout: None,
        }
    }

    /// Creates a simulated stage named `stage` using [`contract_for`].
    pub fn named(stage: &str) -> Self {
        Self::new(contract_for(stage))
    }

    /// Sets how long the stage sleeps before producing output.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the stage fail with the given message.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sets a per-stage timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn placeholder(&self, key: &str, state: &PipelineState) -> Value {
        match key {
            "golden_queries" | "table_names" | "synthetic_data_files" => Value::Array(vec![
                Value::String(format!("{}_1", key)),
                Value::String(format!("{}_2", key)),
            ]),
            "dataset_id" => {
                let company = state
                    .get_str("company_name")
                    .unwrap_or("demo")
                    .to_lowercase()
                    .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
                Value::String(format!("{}_demo", company))
            }
            "company_name" => {
                let host = state
                    .get_str(CUSTOMER_URL_KEY)
                    .and_then(|url| url.split("://").nth(1))
                    .and_then(|rest| rest.split(['/', ':']).next())
                    .unwrap_or("example");
                Value::String(host.split('.').next().unwrap_or(host).to_string())
            }
            _ => Value::String(format!("{} from {}", key, self.contract.stage)),
        }
    }
}

#[async_trait]
impl Stage for SimulatedStage {
    fn name(&self) -> &str {
        &self.contract.stage
    }

    fn contract(&self) -> StageContract {
        self.contract.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, state: PipelineState) -> Result<PipelineState, StageError> {
        self.contract.check_inputs(&state)?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(StageError::Internal(message.clone()));
        }

        let mut output = PipelineState::new();
        for key in &self.contract.produces {
            let value = self.placeholder(key, &state);
            output.insert(key.clone(), value);
        }

        debug!(
            stage = %self.contract.stage,
            keys = output.len(),
            "Simulated stage produced output"
        );

        Ok(output)
    }
}

/// Builds the simulated default pipeline.
pub fn simulated_pipeline(delay: Duration) -> Vec<Arc<dyn Stage>> {
    DEFAULT_STAGE_SEQUENCE
        .iter()
        .map(|name| Arc::new(SimulatedStage::named(name).with_delay(delay)) as Arc<dyn Stage>)
        .collect()
}
