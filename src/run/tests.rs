use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Barrier;

use super::*;
use crate::agent::ToolUseBehavior;
use crate::error::{SessionError, ToolError};
use crate::guardrail::GuardrailFunctionOutput;
use crate::handoff::filters::remove_all_tools;
use crate::schema::OutputType;
use crate::session::MemorySession;
use crate::telemetry::tests::RecordingProcessor;
use crate::tools::computer::{Computer, ComputerAction, ComputerEnvironment};
use crate::tools::{FailureHandling, default_tool_error_message};

#[derive(Default)]
struct MockModel {
    responses: Mutex<VecDeque<Result<ModelResponse, ProviderError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    fn with_responses(responses: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("lock poisoned").clone()
    }

    fn calls(&self) -> usize {
        self.requests.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl Model for MockModel {
    async fn get_response(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push(request.clone());
        let mut guard = self.responses.lock().expect("lock poisoned");
        guard.pop_front().unwrap_or_else(|| {
            Err(ProviderError::Response(
                "no more mock model responses".to_string(),
            ))
        })
    }
}

fn model_ref(mock: &Arc<MockModel>) -> ModelRef {
    ModelRef::Instance(mock.clone())
}

fn response(output: Vec<OutputItem>) -> ModelResponse {
    ModelResponse {
        output,
        usage: Usage::new(1, 10, 5),
        response_id: Some("resp_mock".to_string()),
    }
}

fn text(content: &str) -> ModelResponse {
    response(vec![OutputItem::text(content)])
}

fn call(call_id: &str, name: &str, arguments: &str) -> ModelResponse {
    response(vec![OutputItem::function_call(call_id, name, arguments)])
}

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    a: i64,
    b: i64,
}

fn add_tool() -> FunctionTool {
    FunctionTool::typed("add", "Add two numbers", |_ctx: ToolContext, args: AddArgs| async move {
        Ok::<String, ToolError>((args.a + args.b).to_string())
    })
    .expect("valid schema")
}

fn failing_tool() -> FunctionTool {
    FunctionTool::new("flaky", "Always fails").with_handler(|_ctx, _args| async move {
        Err::<ToolOutput, ToolError>(ToolError::execution("backend unavailable"))
    })
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
struct Verdict {
    approved: bool,
}

#[tokio::test]
async fn plain_text_answer_finishes_in_one_turn() {
    let mock = MockModel::with_responses(vec![text("hello")]);
    let agent = Agent::builder("assistant")
        .instructions("Be brief.")
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "hi", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.final_output, json!("hello"));
    assert_eq!(result.last_agent.name(), "assistant");
    assert_eq!(result.new_items.len(), 1);
    assert_eq!(result.last_response_id(), Some("resp_mock"));
    assert_eq!(result.usage().requests, 1);
    assert_eq!(
        result.to_input_list(),
        vec![InputItem::user("hi"), InputItem::assistant("hello")]
    );

    let requests = mock.requests();
    assert_eq!(requests[0].system_instructions.as_deref(), Some("Be brief."));
    assert_eq!(requests[0].input, vec![InputItem::user("hi")]);
    assert!(requests[0].output_schema.is_none());
}

#[tokio::test]
async fn tool_outputs_are_fed_back_to_the_model() {
    let mock = MockModel::with_responses(vec![
        call("call_1", "add", r#"{"a": 2, "b": 3}"#),
        text("The sum is 5."),
    ]);
    let agent = Agent::builder("calculator")
        .tool(add_tool())
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "add 2 and 3", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.final_output, json!("The sum is 5."));
    assert!(matches!(result.new_items[0], RunItem::ToolCall { .. }));
    assert!(matches!(
        &result.new_items[1],
        RunItem::ToolCallOutput { call_id, output: ToolOutput::Text(out), .. }
            if call_id == "call_1" && out == "5"
    ));
    assert!(matches!(result.new_items[2], RunItem::MessageOutput { .. }));

    let second = &mock.requests()[1];
    assert_eq!(
        second.input[1..],
        [
            InputItem::FunctionCall {
                call_id: "call_1".to_string(),
                name: "add".to_string(),
                arguments: r#"{"a": 2, "b": 3}"#.to_string(),
            },
            InputItem::function_output("call_1", "5"),
        ]
    );
    assert_eq!(result.usage().requests, 2);
    assert_eq!(result.usage().input_tokens, 20);
}

#[tokio::test]
async fn failing_tool_reports_error_to_model_by_default() {
    let mock = MockModel::with_responses(vec![call("call_1", "flaky", "{}"), text("recovered")]);
    let agent = Agent::builder("assistant")
        .tool(failing_tool())
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "go", RunConfig::default())
        .await
        .expect("tool failure is absorbed");

    let expected = default_tool_error_message(&ToolError::execution("backend unavailable"));
    assert!(matches!(
        &result.new_items[1],
        RunItem::ToolCallOutput { output: ToolOutput::Text(out), .. } if *out == expected
    ));
    assert_eq!(result.final_output, json!("recovered"));
}

#[tokio::test]
async fn raise_policy_ends_the_run() {
    let mock = MockModel::with_responses(vec![call("call_1", "flaky", "{}"), text("unreachable")]);
    let agent = Agent::builder("assistant")
        .tool(failing_tool().failure_handling(FailureHandling::Raise))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "go", RunConfig::default())
        .await
        .expect_err("tool error propagates");

    assert!(matches!(err, AgentError::Tool(ToolError::Execution(_))));
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn tripped_input_guardrail_prevents_model_call() {
    let mock = MockModel::with_responses(vec![text("never")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .input_guardrail(InputGuardrail::new("no_homework", |_ctx, _agent, _input| {
            GuardrailFunctionOutput::tripped(json!({"reason": "homework"}))
        }))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "solve my homework", RunConfig::default())
        .await
        .expect_err("guardrail trips");

    match err {
        AgentError::InputGuardrailTripwire(result) => {
            assert_eq!(result.guardrail, "no_homework");
            assert_eq!(result.output.output_info["reason"], "homework");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn run_level_input_guardrails_run_alongside_agent_guardrails() {
    let mock = MockModel::with_responses(vec![text("fine")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .input_guardrail(InputGuardrail::new("agent_check", |_ctx, _agent, _input| {
            GuardrailFunctionOutput::passed()
        }))
        .build()
        .expect("agent");
    let config = RunConfig {
        input_guardrails: vec![InputGuardrail::new_async(
            "run_check",
            |_ctx, _agent, _input| async move { Ok(GuardrailFunctionOutput::passed()) },
        )],
        ..RunConfig::default()
    };

    let result = Runner::run(agent, "hi", config).await.expect("run succeeds");

    let names = result
        .input_guardrail_results
        .iter()
        .map(|r| r.guardrail.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["run_check", "agent_check"]);
}

#[tokio::test]
async fn tripped_output_guardrail_keeps_final_output() {
    let mock = MockModel::with_responses(vec![text("the secret is 42")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .output_guardrail(OutputGuardrail::new("no_secrets", |_ctx, _agent, output| {
            let leaked = output.as_str().is_some_and(|text| text.contains("secret"));
            GuardrailFunctionOutput::new(json!({"leaked": leaked}), leaked)
        }))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "tell me", RunConfig::default())
        .await
        .expect_err("guardrail trips");

    match err {
        AgentError::OutputGuardrailTripwire(result) => {
            assert_eq!(result.agent_output, json!("the secret is 42"));
            assert_eq!(result.agent, "assistant");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn handoff_moves_control_and_output_type_to_target() {
    let mock = MockModel::with_responses(vec![
        call("call_h", "transfer_to_reviewer", "{}"),
        text(r#"{"approved": true}"#),
    ]);
    let reviewer = Agent::builder("reviewer")
        .output_type(OutputType::of::<Verdict>().expect("schema"))
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let triage = Agent::builder("triage")
        .handoff(reviewer)
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(triage, "please review", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.last_agent.name(), "reviewer");
    assert_eq!(
        result.final_output_as::<Verdict>().expect("typed output"),
        Verdict { approved: true }
    );
    assert!(matches!(result.new_items[0], RunItem::HandoffCall { .. }));
    assert!(matches!(
        &result.new_items[1],
        RunItem::HandoffOutput { source, target, .. } if source == "triage" && target == "reviewer"
    ));
    assert_eq!(result.usage().requests, 2);

    let requests = mock.requests();
    assert_eq!(requests[0].handoffs[0].tool_name, "transfer_to_reviewer");
    assert!(requests[0].output_schema.is_none());
    assert!(requests[1].output_schema.is_some());
    assert!(requests[1].handoffs.is_empty());
}

#[tokio::test]
async fn structured_output_mismatch_is_model_behavior() {
    let mock = MockModel::with_responses(vec![text("not json")]);
    let agent = Agent::builder("judge")
        .output_type(OutputType::of::<Verdict>().expect("schema"))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "judge", RunConfig::default())
        .await
        .expect_err("invalid output");
    assert!(err.is_model_behavior());
}

#[tokio::test]
async fn only_first_of_multiple_handoffs_is_taken() {
    let mock = MockModel::with_responses(vec![
        response(vec![
            OutputItem::function_call("h1", "transfer_to_billing", "{}"),
            OutputItem::function_call("h2", "transfer_to_support", "{}"),
        ]),
        text("billing here"),
    ]);
    let billing = Agent::builder("billing")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let support = Agent::builder("support")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let triage = Agent::builder("triage")
        .handoff(billing)
        .handoff(support)
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(triage, "help", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.last_agent.name(), "billing");
    assert!(result.new_items.iter().any(|item| matches!(
        item,
        RunItem::ToolCallOutput { call_id, output: ToolOutput::Text(out), .. }
            if call_id == "h2" && out == MULTIPLE_HANDOFFS_MESSAGE
    )));
}

#[tokio::test]
async fn handoff_input_filter_trims_history() {
    let mock = MockModel::with_responses(vec![
        call("call_1", "add", r#"{"a": 1, "b": 1}"#),
        call("call_h", "transfer_to_writer", "{}"),
        text("done"),
    ]);
    let writer = Agent::builder("writer")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let triage = Agent::builder("triage")
        .tool(add_tool())
        .handoff(Handoff::from(writer).input_filter(remove_all_tools))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(triage, "hi", RunConfig::default())
        .await
        .expect("run succeeds");

    let last_request = mock.requests().pop().expect("request");
    assert_eq!(last_request.input, vec![InputItem::user("hi")]);
    assert_eq!(result.new_items.len(), 1);
}

#[tokio::test]
async fn max_turns_bounds_tool_loops() {
    let mock = MockModel::with_responses(vec![
        call("call_1", "add", r#"{"a": 1, "b": 1}"#),
        call("call_2", "add", r#"{"a": 1, "b": 1}"#),
    ]);
    let agent = Agent::builder("looper")
        .tool(add_tool())
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "loop", RunConfig::default().with_max_turns(1))
        .await
        .expect_err("max turns");

    assert!(matches!(err, AgentError::MaxTurnsExceeded { max_turns: 1 }));
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn unknown_tool_is_model_behavior_error() {
    let mock = MockModel::with_responses(vec![call("call_1", "missing", "{}")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let err = Runner::run(agent, "go", RunConfig::default())
        .await
        .expect_err("unknown tool");

    assert!(err.is_model_behavior());
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn stop_on_first_tool_uses_tool_output() {
    let mock = MockModel::with_responses(vec![call("call_1", "add", r#"{"a": 2, "b": 2}"#)]);
    let agent = Agent::builder("calculator")
        .tool(add_tool())
        .tool_use_behavior(ToolUseBehavior::StopOnFirstTool)
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "2+2", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.final_output, json!("4"));
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn forced_tool_choice_resets_after_tool_use() {
    let mock = MockModel::with_responses(vec![
        call("call_1", "add", r#"{"a": 1, "b": 2}"#),
        text("3"),
    ]);
    let agent = Agent::builder("calculator")
        .tool(add_tool())
        .model_settings(ModelSettings {
            tool_choice: Some(ToolChoice::Required),
            ..ModelSettings::default()
        })
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    Runner::run(Arc::new(agent), "1+2", RunConfig::default())
        .await
        .expect("run succeeds");

    let requests = mock.requests();
    assert_eq!(requests[0].model_settings.tool_choice, Some(ToolChoice::Required));
    assert_eq!(requests[1].model_settings.tool_choice, Some(ToolChoice::Auto));
}

#[tokio::test]
async fn session_history_is_prepended_and_persisted() {
    let mock = MockModel::with_responses(vec![text("hello"), text("hello again")]);
    let agent = Arc::new(
        Agent::builder("assistant")
            .model(model_ref(&mock))
            .build()
            .expect("agent"),
    );
    let session: Arc<dyn Session> = Arc::new(MemorySession::new("conv"));
    let config = RunConfig {
        session: Some(Arc::clone(&session)),
        ..RunConfig::default()
    };

    Runner::run(Arc::clone(&agent), "hi", config.clone())
        .await
        .expect("first run");
    assert_eq!(
        session.get_items(None).await.expect("items"),
        vec![InputItem::user("hi"), InputItem::assistant("hello")]
    );

    Runner::run(agent, "again", config).await.expect("second run");
    assert_eq!(
        mock.requests()[1].input,
        vec![
            InputItem::user("hi"),
            InputItem::assistant("hello"),
            InputItem::user("again"),
        ]
    );
    assert_eq!(session.get_items(None).await.expect("items").len(), 4);
}

#[tokio::test]
async fn streamed_run_forwards_model_events_and_items() {
    let mock = MockModel::with_responses(vec![text("hello")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let events = Runner::run_streamed(agent, "hi", RunConfig::default())
        .try_collect::<Vec<_>>()
        .await
        .expect("stream succeeds");

    assert!(matches!(
        &events[0],
        RunEvent::RawModel(ModelStreamEvent::OutputTextDelta { delta }) if delta == "hello"
    ));
    assert!(matches!(
        &events[1],
        RunEvent::RawModel(ModelStreamEvent::Completed(_))
    ));
    assert!(matches!(&events[2], RunEvent::Item(RunItem::MessageOutput { .. })));
    match events.last() {
        Some(RunEvent::Completed(result)) => assert_eq!(result.final_output, json!("hello")),
        other => panic!("unexpected last event: {other:?}"),
    }
}

#[tokio::test]
async fn streamed_handoff_emits_agent_update() {
    let mock = MockModel::with_responses(vec![call("h1", "transfer_to_b", "{}"), text("from b")]);
    let b = Agent::builder("b")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let a = Agent::builder("a")
        .handoff(b)
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let events = Runner::run_streamed(a, "hi", RunConfig::default())
        .try_collect::<Vec<_>>()
        .await
        .expect("stream succeeds");

    assert!(events.iter().any(|event| matches!(
        event,
        RunEvent::AgentUpdated { agent } if agent.name() == "b"
    )));
}

#[derive(Default)]
struct CountingHooks {
    agent_starts: AtomicUsize,
    tool_ends: AtomicUsize,
    llm_ends: AtomicUsize,
    handoffs: AtomicUsize,
}

#[async_trait]
impl RunHooks for Arc<CountingHooks> {
    async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {
        self.agent_starts.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_handoff(&self, _ctx: &RunContext, _from: &Agent, _to: &Agent) {
        self.handoffs.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool: &str,
        _output: &ToolOutput,
    ) {
        self.tool_ends.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_llm_end(&self, _ctx: &RunContext, _agent: &Agent, _response: &ModelResponse) {
        self.llm_ends.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn run_hooks_observe_lifecycle() {
    let mock = MockModel::with_responses(vec![
        call("call_1", "add", r#"{"a": 1, "b": 1}"#),
        call("h1", "transfer_to_b", "{}"),
        text("done"),
    ]);
    let b = Agent::builder("b")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let a = Agent::builder("a")
        .tool(add_tool())
        .handoff(b)
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let hooks = Arc::new(CountingHooks::default());

    Runner::run(a, "hi", RunConfig::default().with_hooks(Arc::clone(&hooks)))
        .await
        .expect("run succeeds");

    assert_eq!(hooks.agent_starts.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.tool_ends.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.llm_ends.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.handoffs.load(Ordering::SeqCst), 1);
}

struct FixedProvider(Arc<MockModel>, Mutex<Vec<Option<String>>>);

impl ModelProvider for FixedProvider {
    fn get_model(&self, name: Option<&str>) -> Result<Arc<dyn Model>, ProviderError> {
        self.1
            .lock()
            .expect("lock poisoned")
            .push(name.map(str::to_string));
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn model_names_resolve_through_provider() {
    let mock = MockModel::with_responses(vec![text("hi")]);
    let provider = Arc::new(FixedProvider(Arc::clone(&mock), Mutex::new(Vec::new())));
    let agent = Agent::builder("assistant")
        .model("mock-1")
        .build()
        .expect("agent");
    let config = RunConfig {
        model_provider: Some(provider.clone()),
        ..RunConfig::default()
    };

    Runner::run(agent, "hello", config).await.expect("run succeeds");

    assert_eq!(
        *provider.1.lock().expect("lock poisoned"),
        vec![Some("mock-1".to_string())]
    );
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn traces_record_agent_and_generation_spans() {
    let mock = MockModel::with_responses(vec![call("call_1", "add", r#"{"a": 1, "b": 1}"#), text("2")]);
    let agent = Agent::builder("calculator")
        .tool(add_tool())
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let recorder = Arc::new(RecordingProcessor::default());
    let provider = Arc::new(TraceProvider::new().with_processor(recorder.clone()));
    let config = RunConfig {
        workflow_name: "math".to_string(),
        trace_include_sensitive_data: false,
        ..RunConfig::default()
    }
    .with_trace_provider(provider);

    let result = Runner::run(agent, "1+1", config).await.expect("run succeeds");
    assert!(result.trace_id.is_some());

    let events = recorder.events.lock().expect("lock").clone();
    assert_eq!(events.first().map(String::as_str), Some("trace_start:math"));
    assert_eq!(events.last().map(String::as_str), Some("trace_end:math"));

    let spans = recorder.ended_spans.lock().expect("lock").clone();
    let agent_span = spans
        .iter()
        .find(|span| matches!(span.span_data, SpanData::Agent { .. }))
        .expect("agent span");
    let generations = spans
        .iter()
        .filter(|span| matches!(span.span_data, SpanData::Generation { .. }))
        .collect::<Vec<_>>();
    assert_eq!(generations.len(), 2);
    assert!(generations
        .iter()
        .all(|span| span.parent_id.as_deref() == Some(agent_span.id.as_str())));
    assert!(matches!(
        generations[0].span_data,
        SpanData::Generation { input: None, output: None, .. }
    ));
    assert!(spans.iter().any(|span| matches!(
        &span.span_data,
        SpanData::Function { name, input: None, .. } if name == "add"
    )));
}

#[tokio::test]
async fn disabled_tracing_records_nothing() {
    let mock = MockModel::with_responses(vec![text("ok")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let recorder = Arc::new(RecordingProcessor::default());
    let provider = Arc::new(TraceProvider::new().with_processor(recorder.clone()));
    let config = RunConfig {
        tracing_disabled: true,
        ..RunConfig::default()
    }
    .with_trace_provider(provider);

    let result = Runner::run(agent, "hi", config).await.expect("run succeeds");

    assert!(result.trace_id.is_none());
    assert!(recorder.events.lock().expect("lock").is_empty());
    assert_eq!(mock.requests()[0].tracing, ModelTracing::Disabled);
}

struct StaticScreen;

#[async_trait]
impl Computer for StaticScreen {
    fn environment(&self) -> ComputerEnvironment {
        ComputerEnvironment::Browser
    }

    fn dimensions(&self) -> (u32, u32) {
        (800, 600)
    }

    async fn perform(&self, _action: &ComputerAction) -> Result<(), ToolError> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<String, ToolError> {
        Ok("SCREEN".to_string())
    }
}

#[tokio::test]
async fn computer_actions_answer_with_screenshot() {
    let mock = MockModel::with_responses(vec![
        response(vec![OutputItem::ComputerCall {
            id: None,
            call_id: "cc_1".to_string(),
            action: json!({"type": "screenshot"}),
        }]),
        text("I see the screen"),
    ]);
    let agent = Agent::builder("operator")
        .tool(ComputerTool::new(StaticScreen))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "look", RunConfig::default())
        .await
        .expect("run succeeds");

    assert!(matches!(
        &result.new_items[1],
        RunItem::ToolCallOutput {
            raw: InputItem::ComputerCallOutput { image_url, .. },
            ..
        } if image_url == "data:image/png;base64,SCREEN"
    ));
    assert_eq!(result.final_output, json!("I see the screen"));
}

#[tokio::test]
async fn agent_as_tool_runs_nested_agent() {
    let inner_mock = MockModel::with_responses(vec![text("bonjour")]);
    let translator = Arc::new(
        Agent::builder("translator")
            .model(model_ref(&inner_mock))
            .build()
            .expect("agent"),
    );
    let outer_mock = MockModel::with_responses(vec![
        call("call_1", "translate", r#"{"input": "hello"}"#),
        text("It is bonjour."),
    ]);
    let orchestrator = Agent::builder("orchestrator")
        .tool(translator.as_tool("translate", "Translate to French").expect("tool"))
        .model(model_ref(&outer_mock))
        .build()
        .expect("agent");

    let result = Runner::run(orchestrator, "translate hello", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(inner_mock.requests()[0].input, vec![InputItem::user("hello")]);
    assert!(matches!(
        &result.new_items[1],
        RunItem::ToolCallOutput { output: ToolOutput::Text(out), .. } if out == "bonjour"
    ));
    assert_eq!(result.final_output, json!("It is bonjour."));
}

#[tokio::test]
async fn reused_context_counts_usage_per_run() {
    #[derive(Debug)]
    struct Tenant(&'static str);

    let mock = MockModel::with_responses(vec![text("one"), text("two")]);
    let agent = Arc::new(
        Agent::builder("assistant")
            .model(model_ref(&mock))
            .build()
            .expect("agent"),
    );
    let ctx = RunContext::new().with(Tenant("acme"));

    for _ in 0..2 {
        let result = Runner::run(
            Arc::clone(&agent),
            "hi",
            RunConfig::default().with_context(ctx.clone()),
        )
        .await
        .expect("run succeeds");
        assert_eq!(result.raw_responses.len(), 1);
        assert_eq!(result.usage().requests, 1);
        assert_eq!(result.usage().input_tokens, 10);
        assert_eq!(
            result.context.get::<Tenant>().map(|tenant| tenant.0),
            Some("acme")
        );
    }
    assert_eq!(ctx.usage(), Usage::default());
}

fn rendezvous_tool(
    name: &'static str,
    barrier: Arc<Barrier>,
    linger: Duration,
    finished: Arc<Mutex<Vec<&'static str>>>,
) -> FunctionTool {
    FunctionTool::new(name, "Meets its sibling before answering").with_handler(move |_ctx, _args| {
        let barrier = Arc::clone(&barrier);
        let finished = Arc::clone(&finished);
        async move {
            barrier.wait().await;
            tokio::time::sleep(linger).await;
            finished.lock().expect("lock poisoned").push(name);
            Ok::<&str, ToolError>(name)
        }
    })
}

#[tokio::test]
async fn same_turn_tools_run_concurrently_and_keep_call_order() {
    let mock = MockModel::with_responses(vec![
        response(vec![
            OutputItem::function_call("call_1", "slow", "{}"),
            OutputItem::function_call("call_2", "fast", "{}"),
        ]),
        text("both done"),
    ]);
    let barrier = Arc::new(Barrier::new(2));
    let finished = Arc::new(Mutex::new(Vec::new()));
    let agent = Agent::builder("parallel")
        .tool(rendezvous_tool(
            "slow",
            Arc::clone(&barrier),
            Duration::from_millis(30),
            Arc::clone(&finished),
        ))
        .tool(rendezvous_tool(
            "fast",
            Arc::clone(&barrier),
            Duration::ZERO,
            Arc::clone(&finished),
        ))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Runner::run(agent, "go", RunConfig::default()),
    )
    .await
    .expect("tools must not wait on each other sequentially")
    .expect("run succeeds");

    assert_eq!(*finished.lock().expect("lock poisoned"), vec!["fast", "slow"]);
    let outputs = result
        .new_items
        .iter()
        .filter_map(|item| match item {
            RunItem::ToolCallOutput { call_id, output, .. } => {
                Some((call_id.as_str(), output.to_model_string()))
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        outputs,
        vec![
            ("call_1", "slow".to_string()),
            ("call_2", "fast".to_string()),
        ]
    );
    assert_eq!(
        mock.requests()[1].input[3..],
        [
            InputItem::function_output("call_1", "slow"),
            InputItem::function_output("call_2", "fast"),
        ]
    );
}

#[tokio::test]
async fn input_guardrails_run_concurrently() {
    let mock = MockModel::with_responses(vec![text("checked")]);
    let barrier = Arc::new(Barrier::new(2));
    let guardrail = |name: &'static str| {
        let barrier = Arc::clone(&barrier);
        InputGuardrail::new_async(name, move |_ctx, _agent, _input| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(GuardrailFunctionOutput::passed())
            }
        })
    };
    let agent = Agent::builder("assistant")
        .input_guardrail(guardrail("first"))
        .input_guardrail(guardrail("second"))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Runner::run(agent, "hi", RunConfig::default()),
    )
    .await
    .expect("guardrails must not run one after another")
    .expect("run succeeds");

    assert_eq!(result.input_guardrail_results.len(), 2);
    assert_eq!(result.final_output, json!("checked"));
}

#[tokio::test]
async fn structured_output_becomes_final_value() {
    let mock = MockModel::with_responses(vec![text(r#"{"approved": false}"#)]);
    let agent = Agent::builder("judge")
        .output_type(OutputType::of::<Verdict>().expect("schema"))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "judge this", RunConfig::default())
        .await
        .expect("run succeeds");

    assert_eq!(result.final_output, json!({"approved": false}));
    assert_eq!(
        result.final_output_as::<Verdict>().expect("typed output"),
        Verdict { approved: false }
    );
    let schema = mock.requests()[0]
        .output_schema
        .clone()
        .expect("schema sent to model");
    assert!(schema.strict);
    assert_eq!(schema.schema["required"], json!(["approved"]));
    assert!(schema.schema["properties"].get("response").is_none());
}

struct BrokenSession;

#[async_trait]
impl Session for BrokenSession {
    fn session_id(&self) -> &str {
        "broken"
    }

    async fn get_items(&self, _limit: Option<usize>) -> Result<Vec<InputItem>, SessionError> {
        Ok(vec![InputItem::user("earlier")])
    }

    async fn add_items(&self, _items: Vec<InputItem>) -> Result<(), SessionError> {
        Err(SessionError::Storage("disk full".to_string()))
    }

    async fn pop_item(&self) -> Result<Option<InputItem>, SessionError> {
        Ok(None)
    }

    async fn clear_session(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[tokio::test]
async fn failing_session_store_does_not_fail_run() {
    let mock = MockModel::with_responses(vec![text("still here")]);
    let agent = Agent::builder("assistant")
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    let result = Runner::run(agent, "hi", RunConfig::default().with_session(BrokenSession))
        .await
        .expect("store failures are logged, not raised");

    assert_eq!(result.final_output, json!("still here"));
    assert_eq!(
        mock.requests()[0].input,
        vec![InputItem::user("earlier"), InputItem::user("hi")]
    );
}

#[tokio::test]
async fn agent_handoff_hooks_fire_only_on_receiving_agent() {
    let mock = MockModel::with_responses(vec![call("h1", "transfer_to_b", "{}"), text("from b")]);
    let source_hooks = Arc::new(CountingHooks::default());
    let target_hooks = Arc::new(CountingHooks::default());
    let run_hooks = Arc::new(CountingHooks::default());
    let b = Agent::builder("b")
        .hooks(Arc::clone(&target_hooks))
        .model(model_ref(&mock))
        .build()
        .expect("agent");
    let a = Agent::builder("a")
        .handoff(b)
        .hooks(Arc::clone(&source_hooks))
        .model(model_ref(&mock))
        .build()
        .expect("agent");

    Runner::run(a, "hi", RunConfig::default().with_hooks(Arc::clone(&run_hooks)))
        .await
        .expect("run succeeds");

    assert_eq!(run_hooks.handoffs.load(Ordering::SeqCst), 1);
    assert_eq!(source_hooks.handoffs.load(Ordering::SeqCst), 0);
    assert_eq!(target_hooks.handoffs.load(Ordering::SeqCst), 1);
    assert_eq!(source_hooks.agent_starts.load(Ordering::SeqCst), 1);
    assert_eq!(target_hooks.agent_starts.load(Ordering::SeqCst), 1);
}
