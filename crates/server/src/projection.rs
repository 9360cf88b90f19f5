//! Markdown and MDX views of a session

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};

use mdxai_protocol::{SessionState, Todo, TodoStatus, ToolExecution};

pub fn render_markdown(state: &SessionState) -> String {
    let mut out = frontmatter(state);

    let _ = writeln!(out, "# Session {}", state.id);
    out.push('\n');
    let _ = writeln!(out, "{}", summary_line(state));
    if let Some(prompt) = &state.prompt {
        out.push('\n');
        for line in prompt.lines() {
            let _ = writeln!(out, "> {line}");
        }
    }
    if let Some(error) = &state.error {
        out.push('\n');
        let _ = writeln!(out, "**Error:** {error}");
    }

    if !state.todos.is_empty() {
        out.push_str("\n## Todos\n\n");
        for todo in &state.todos {
            let _ = writeln!(out, "{}", todo_line(todo, str::to_string));
        }
    }

    if !state.tools.is_empty() {
        out.push_str("\n## Tools\n\n");
        for tool in &state.tools {
            let _ = writeln!(out, "- {}", tool_line(tool));
        }
    }

    out
}

/// Same content as `render_markdown`, with sections wrapped in components.
pub fn render_mdx(state: &SessionState) -> String {
    let mut out = frontmatter(state);

    let _ = writeln!(out, "# Session {}", mdx_text(&state.id));
    out.push('\n');
    let _ = writeln!(
        out,
        "<SessionStatus status=\"{}\" model=\"{}\" />",
        state.status.as_str(),
        attr(&state.model)
    );
    if let Some(error) = &state.error {
        out.push('\n');
        let _ = writeln!(out, "**Error:** {}", mdx_text(error));
    }

    if !state.todos.is_empty() {
        out.push_str("\n## Todos\n\n<TodoList>\n\n");
        for todo in &state.todos {
            let _ = writeln!(out, "{}", todo_line(todo, mdx_text));
        }
        out.push_str("\n</TodoList>\n");
    }

    if !state.tools.is_empty() {
        out.push_str("\n## Tools\n\n");
        for tool in &state.tools {
            let duration = tool
                .duration
                .map(|ms| format!(" duration={{{ms}}}"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "<ToolCall id=\"{}\" tool=\"{}\" status=\"{}\"{} />",
                attr(&tool.id),
                attr(&tool.tool),
                tool.status.as_str(),
                duration
            );
        }
    }

    out
}

fn frontmatter(state: &SessionState) -> String {
    let mut out = String::from("---\n");
    let _ = writeln!(out, "id: {}", yaml_str(&state.id));
    let _ = writeln!(out, "status: {}", state.status.as_str());
    let _ = writeln!(out, "model: {}", yaml_str(&state.model));
    let _ = writeln!(out, "cwd: {}", yaml_str(&state.cwd));
    let _ = writeln!(out, "executionMode: {}", yaml_str(&state.execution_mode));
    let _ = writeln!(out, "startedAt: {}", timestamp(&state.started_at));
    if let Some(completed_at) = &state.completed_at {
        let _ = writeln!(out, "completedAt: {}", timestamp(completed_at));
    }
    if let Some(cost) = state.cost {
        let _ = writeln!(out, "cost: {cost}");
    }
    if let Some(duration) = state.duration {
        let _ = writeln!(out, "duration: {duration}");
    }
    if let Some(usage) = &state.usage {
        let _ = writeln!(out, "totalTokens: {}", usage.total_tokens);
    }
    out.push_str("---\n\n");
    out
}

fn summary_line(state: &SessionState) -> String {
    let mut line = format!(
        "**Status:** {} | **Model:** {}",
        state.status.as_str(),
        state.model
    );
    if let Some(cost) = state.cost {
        let _ = write!(line, " | **Cost:** ${cost:.4}");
    }
    line
}

fn todo_line(todo: &Todo, text: fn(&str) -> String) -> String {
    match todo.status {
        TodoStatus::Completed => format!("- [x] {}", text(&todo.content)),
        TodoStatus::InProgress if !todo.active_form.is_empty() => {
            format!("- [ ] {} _(in progress)_", text(&todo.active_form))
        }
        TodoStatus::InProgress => format!("- [ ] {} _(in progress)_", text(&todo.content)),
        TodoStatus::Pending => format!("- [ ] {}", text(&todo.content)),
    }
}

fn tool_line(tool: &ToolExecution) -> String {
    let mut line = format!("`{}` - {}", tool.tool, tool.status.as_str());
    if let Some(ms) = tool.duration {
        let _ = write!(line, " ({ms}ms)");
    }
    if let Some(error) = &tool.error {
        let _ = write!(line, ": {error}");
    }
    line
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Double-quoted YAML scalar
fn yaml_str(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Text node safe for MDX: braces open expressions and `<` opens JSX.
fn mdx_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '{' => out.push_str("\\{"),
            '}' => out.push_str("\\}"),
            '<' => out.push_str("&lt;"),
            _ => out.push(c),
        }
    }
    out
}

fn attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{create_initial_state, reduce, SessionInit, TODO_WRITE_TOOL};
    use chrono::{Duration, TimeZone};
    use mdxai_protocol::{StreamEvent, TokenUsage};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap()
    }

    fn minimal() -> SessionState {
        create_initial_state("abc", &SessionInit::default(), t0())
    }

    fn worked() -> SessionState {
        let events = [
            StreamEvent::ToolUse {
                id: "w1".into(),
                tool: TODO_WRITE_TOOL.into(),
                input: json!({"todos": [
                    {
                        "content": "Read the code",
                        "activeForm": "Reading the code",
                        "status": "completed"
                    },
                    {
                        "content": "Fix the bug",
                        "activeForm": "Fixing the bug",
                        "status": "in_progress"
                    },
                    {"content": "Write tests", "activeForm": "Writing tests", "status": "pending"},
                ]}),
                timestamp: None,
            },
            StreamEvent::ToolUse {
                id: "t2".into(),
                tool: "Bash".into(),
                input: json!({"command": "cargo test"}),
                timestamp: None,
            },
            StreamEvent::ToolResult {
                id: "t2".into(),
                output: json!("1 failed"),
                error: Some("exit status 101".into()),
                timestamp: Some(t0() + Duration::milliseconds(1200)),
            },
            StreamEvent::Result {
                cost: 0.0125,
                duration: 4200.0,
                usage: TokenUsage {
                    input_tokens: 900,
                    output_tokens: 100,
                    total_tokens: 1000,
                },
                timestamp: None,
            },
        ];
        events
            .iter()
            .fold(minimal(), |state, event| reduce(state, event, t0()))
    }

    #[test]
    fn markdown_renders_minimal_state() {
        let md = render_markdown(&minimal());

        assert!(md.starts_with("---\nid: \"abc\"\nstatus: idle\n"));
        assert!(md.contains("startedAt: 2026-02-03T04:05:06.000Z\n"));
        assert!(md.contains("# Session abc"));
        assert!(md.contains("**Status:** idle"));
        assert!(!md.contains("## Todos"));
        assert!(!md.contains("## Tools"));
        assert!(!md.contains("completedAt"));
    }

    #[test]
    fn markdown_renders_todos_as_checklist() {
        let md = render_markdown(&worked());

        assert!(md.contains("- [x] Read the code\n"));
        assert!(md.contains("- [ ] Fixing the bug _(in progress)_\n"));
        assert!(md.contains("- [ ] Write tests\n"));
    }

    #[test]
    fn markdown_lists_tools_with_status() {
        let md = render_markdown(&worked());

        assert!(md.contains("- `TodoWrite` - running\n"));
        assert!(md.contains("- `Bash` - error (1200ms): exit status 101\n"));
        assert!(md.contains("status: completed\n"));
        assert!(md.contains("cost: 0.0125\n"));
        assert!(md.contains("totalTokens: 1000\n"));
        assert!(md.contains("completedAt: "));
    }

    #[test]
    fn mdx_wraps_sections_in_components() {
        let mdx = render_mdx(&worked());

        assert!(mdx.starts_with("---\n"));
        assert!(mdx.contains("<SessionStatus status=\"completed\""));
        assert!(mdx.contains("<TodoList>"));
        assert!(mdx.contains("</TodoList>"));
        assert!(mdx.contains(
            "<ToolCall id=\"t2\" tool=\"Bash\" status=\"error\" duration={1200} />"
        ));
        assert!(mdx.contains("<ToolCall id=\"w1\" tool=\"TodoWrite\" status=\"running\" />"));
    }

    #[test]
    fn mdx_renders_minimal_state() {
        let mdx = render_mdx(&minimal());
        assert!(mdx.contains("<SessionStatus status=\"idle\""));
        assert!(!mdx.contains("<TodoList>"));
    }

    #[test]
    fn quotes_are_escaped() {
        let mut state = minimal();
        state.cwd = "/tmp/\"odd\"".into();
        state.model = "m\"x".into();

        assert!(render_markdown(&state).contains("cwd: \"/tmp/\\\"odd\\\"\"\n"));
        assert!(render_mdx(&state).contains("model=\"m&quot;x\""));
    }

    #[test]
    fn mdx_escapes_braces_and_tags_in_text() {
        let mut state = minimal();
        state.error = Some("bad {\"code\":1} <eof>".into());
        state.todos = vec![Todo {
            content: "handle {x} and <T>".into(),
            active_form: "Handling {x}".into(),
            status: TodoStatus::Pending,
        }];

        let mdx = render_mdx(&state);
        assert!(mdx.contains("**Error:** bad \\{\"code\":1\\} &lt;eof>\n"));
        assert!(mdx.contains("- [ ] handle \\{x\\} and &lt;T>\n"));
        assert!(!mdx.contains("{x}"));

        let md = render_markdown(&state);
        assert!(md.contains("**Error:** bad {\"code\":1} <eof>\n"));
        assert!(md.contains("- [ ] handle {x} and <T>\n"));
    }

    #[test]
    fn summary_uses_ascii_separators() {
        let md = render_markdown(&worked());
        assert!(md.contains("**Status:** completed | **Model:** "));
        assert!(md.contains(" | **Cost:** $0.0125"));
    }
}
