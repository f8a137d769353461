//! Pass/fail checks run on a run's input before the first model call and on
//! the final output before it is returned.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::AgentError;
use crate::items::RunInput;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GuardrailFunctionOutput {
    pub tripwire_triggered: bool,
    /// Free-form diagnostics from the check.
    pub output_info: Value,
}

impl GuardrailFunctionOutput {
    pub fn new(output_info: Value, tripwire_triggered: bool) -> Self {
        Self {
            tripwire_triggered,
            output_info,
        }
    }

    pub fn passed() -> Self {
        Self::default()
    }

    pub fn tripped(output_info: Value) -> Self {
        Self::new(output_info, true)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputGuardrailResult {
    pub guardrail: String,
    pub output: GuardrailFunctionOutput,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutputGuardrailResult {
    pub guardrail: String,
    /// The final output the guardrail checked.
    pub agent_output: Value,
    pub agent: String,
    pub output: GuardrailFunctionOutput,
}

type GuardrailFn<I> = dyn Fn(RunContext, Arc<Agent>, I) -> BoxFuture<'static, Result<GuardrailFunctionOutput, AgentError>>
    + Send
    + Sync;

#[derive(Clone)]
pub struct InputGuardrail {
    name: String,
    check: Arc<GuardrailFn<RunInput>>,
}

impl std::fmt::Debug for InputGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputGuardrail")
            .field("name", &self.name)
            .finish()
    }
}

impl InputGuardrail {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&RunContext, &Agent, &RunInput) -> GuardrailFunctionOutput + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move |ctx, agent, input| {
                let output = check(&ctx, &agent, &input);
                Box::pin(async move { Ok(output) })
            }),
        }
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(RunContext, Arc<Agent>, RunInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GuardrailFunctionOutput, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move |ctx, agent, input| Box::pin(check(ctx, agent, input))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(
        &self,
        ctx: RunContext,
        agent: Arc<Agent>,
        input: RunInput,
    ) -> Result<InputGuardrailResult, AgentError> {
        let output = (self.check)(ctx, agent, input).await?;
        Ok(InputGuardrailResult {
            guardrail: self.name.clone(),
            output,
        })
    }
}

#[derive(Clone)]
pub struct OutputGuardrail {
    name: String,
    check: Arc<GuardrailFn<Value>>,
}

impl std::fmt::Debug for OutputGuardrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputGuardrail")
            .field("name", &self.name)
            .finish()
    }
}

impl OutputGuardrail {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&RunContext, &Agent, &Value) -> GuardrailFunctionOutput + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move |ctx, agent, output| {
                let result = check(&ctx, &agent, &output);
                Box::pin(async move { Ok(result) })
            }),
        }
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(RunContext, Arc<Agent>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GuardrailFunctionOutput, AgentError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(move |ctx, agent, output| Box::pin(check(ctx, agent, output))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(
        &self,
        ctx: RunContext,
        agent: Arc<Agent>,
        agent_output: Value,
    ) -> Result<OutputGuardrailResult, AgentError> {
        let agent_name = agent.name().to_string();
        let output = (self.check)(ctx, agent, agent_output.clone()).await?;
        Ok(OutputGuardrailResult {
            guardrail: self.name.clone(),
            agent_output,
            agent: agent_name,
            output,
        })
    }
}
