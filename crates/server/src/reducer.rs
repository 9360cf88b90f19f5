//! Pure session reducer
//!
//! All state changes for a session go through `reduce(state, event, now)`.
//! No IO, no async, no locking; the actor persists and broadcasts the
//! result. `now` is the arrival clock used for events that carry no
//! timestamp of their own.

use chrono::{DateTime, Utc};
use serde_json::Value;

use mdxai_protocol::{
    new_id, MessageType, SessionMessage, SessionState, SessionStatus, StreamEvent, Todo,
    TodoStatus, ToolExecution, ToolStatus,
};

/// Tool whose input replaces the session todo list wholesale
pub const TODO_WRITE_TOOL: &str = "TodoWrite";

// ---------------------------------------------------------------------------
// Initial state
// ---------------------------------------------------------------------------

/// Creation-time metadata. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInit {
    pub execution_mode: String,
    pub model: String,
    pub cwd: String,
    pub prompt: Option<String>,
}

impl Default for SessionInit {
    fn default() -> Self {
        Self {
            execution_mode: "sdk".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            cwd: "/".to_string(),
            prompt: None,
        }
    }
}

pub fn create_initial_state(id: &str, init: &SessionInit, now: DateTime<Utc>) -> SessionState {
    SessionState {
        id: id.to_string(),
        status: SessionStatus::Idle,
        execution_mode: init.execution_mode.clone(),
        model: init.model.clone(),
        cwd: init.cwd.clone(),
        prompt: init.prompt.clone(),
        started_at: now,
        completed_at: None,
        plan: Vec::new(),
        todos: Vec::new(),
        tools: Vec::new(),
        messages: Vec::new(),
        cost: None,
        duration: None,
        usage: None,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// reduce(): the pure core
// ---------------------------------------------------------------------------

/// Apply one event and return the next state.
pub fn reduce(mut state: SessionState, event: &StreamEvent, now: DateTime<Utc>) -> SessionState {
    let timestamp = event.timestamp().unwrap_or(now);

    match event {
        StreamEvent::Assistant { content, .. } => {
            push_message(
                &mut state,
                MessageType::Assistant,
                Value::String(content.clone()),
                timestamp,
            );
        }

        StreamEvent::ToolUse {
            id, tool, input, ..
        } => {
            state.tools.push(ToolExecution {
                id: id.clone(),
                tool: tool.clone(),
                input: input.clone(),
                output: None,
                status: ToolStatus::Running,
                started_at: timestamp,
                completed_at: None,
                duration: None,
                error: None,
            });

            if tool == TODO_WRITE_TOOL {
                if let Some(todos) = todos_from_input(input) {
                    state.todos = todos;
                }
            }

            push_message(&mut state, MessageType::ToolUse, input.clone(), timestamp);
        }

        StreamEvent::ToolResult {
            id, output, error, ..
        } => {
            // Unmatched ids (result before its tool_use) only reach the transcript.
            if let Some(tool) = state.tools.iter_mut().find(|t| &t.id == id) {
                tool.output = Some(output.clone());
                tool.status = if error.is_some() {
                    ToolStatus::Error
                } else {
                    ToolStatus::Success
                };
                tool.completed_at = Some(timestamp);
                tool.duration = Some(
                    (timestamp - tool.started_at)
                        .num_milliseconds()
                        .max(0),
                );
                if let Some(error) = error {
                    tool.error = Some(error.clone());
                }
            }

            push_message(&mut state, MessageType::ToolResult, output.clone(), timestamp);
        }

        StreamEvent::Result {
            cost,
            duration,
            usage,
            ..
        } => {
            if !state.status.is_terminal() {
                state.status = SessionStatus::Completed;
                state.completed_at = Some(timestamp);
                state.cost = Some(*cost);
                state.duration = Some(*duration);
                state.usage = Some(usage.clone());
            }
        }

        StreamEvent::Error { error, .. } => {
            if !state.status.is_terminal() {
                state.status = SessionStatus::Error;
                state.error = Some(error.clone());
                state.completed_at = Some(timestamp);
            }
        }

        StreamEvent::Unknown { .. } => {}
    }

    if state.status == SessionStatus::Idle && !state.tools.is_empty() {
        state.status = SessionStatus::Running;
    }

    state
}

fn push_message(
    state: &mut SessionState,
    message_type: MessageType,
    content: Value,
    timestamp: DateTime<Utc>,
) {
    state.messages.push(SessionMessage {
        id: new_id(),
        message_type,
        content,
        timestamp,
    });
}

/// Map `input.todos` of a `TodoWrite` call. `None` when absent or not a list.
fn todos_from_input(input: &Value) -> Option<Vec<Todo>> {
    let items = input.get("todos")?.as_array()?;
    let text = |item: &Value, key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Some(
        items
            .iter()
            .map(|item| Todo {
                content: text(item, "content"),
                active_form: text(item, "activeForm"),
                status: TodoStatus::from_loose(
                    item.get("status").and_then(Value::as_str).unwrap_or_default(),
                ),
            })
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
