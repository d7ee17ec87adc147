//! The execution core of Blade.
//!
//! An [`Agent`] runs one user message to completion:
//!
//! 1. **Persist** the user message to the session log
//! 2. **Ask the model** through the active [`ExecutionEngine`], streaming
//!    deltas through the [`StreamAggregator`] when the caller listens
//! 3. **If tool calls**: dispatch them through the execution pipeline,
//!    append call/result pairs in request order, loop back to step 2
//! 4. **If text only**: append the answer and return a [`LoopResult`]
//!
//! The loop also ends on cancellation, an exhausted turn budget, or a model
//! stuck repeating one tool call. In Plan mode the [`PlanModeInjector`] sits
//! in front of the loop.

pub mod aggregator;
pub mod context;
pub mod loop_detection;
pub mod loop_runner;
pub mod model_manager;
pub mod plan_mode;
pub mod prompt;
mod recorder;
pub mod result;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use aggregator::{AggregatedResponse, StreamAggregator, is_streaming_unsupported};
pub use context::{
    ChatContext, ContextManager, EstimatingTokenCounter, LoopOptions, TurnLimitCallback,
    TurnLimitDecision, TurnLimitInfo, link_cancellation,
};
pub use loop_detection::LoopDetector;
pub use loop_runner::Agent;
pub use model_manager::{DEFAULT_MAX_CONTEXT_TOKENS, ExecutionEngine, INHERIT_MODEL, ModelManager};
pub use plan_mode::{EXIT_PLAN_MODE_TOOL, ExitPlanModeTool, PLAN_MODE_REMINDER, PlanModeInjector};
pub use prompt::{PROJECT_INSTRUCTIONS_FILE, SystemPromptBuilder};
pub use result::{LoopError, LoopErrorKind, LoopMetadata, LoopResult};
pub use stream_event::{AgentEvent, EventSink};
