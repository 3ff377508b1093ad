//! Completion summary rendering.

use std::sync::LazyLock;

use conveyor_common::{ConditionType, PipelineExecution};
use regex::Regex;
use tracing::warn;

static REPO_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*/([^/]*?)/([^/]*?)\.git").expect("valid regex"));

const UNKNOWN_DURATION: &str = "<Unknown>";

/// A rendered notification. `title` is only used by email-like channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub content: String,
}

/// `"<owner>/<repo>"` from a `.../<owner>/<repo>.git` URL, or `"<url>"` when
/// the URL does not have that shape.
pub fn repo_name_from_url(url: &str) -> String {
    match REPO_URL_REGEX.captures(url) {
        Some(caps) => format!("{}/{}", &caps[1], &caps[2]),
        None => {
            warn!(url = %url, "Failed to parse git repository URL");
            format!("<{}>", url)
        }
    }
}

fn state_str(execution: &PipelineExecution) -> &'static str {
    execution.state().map(|s| s.as_str()).unwrap_or("")
}

fn duration(execution: &PipelineExecution) -> String {
    match (execution.status.started, execution.status.ended) {
        (Some(started), Some(ended)) => match (ended - started).to_std() {
            Ok(elapsed) => humantime::format_duration(elapsed).to_string(),
            Err(_) => UNKNOWN_DURATION.to_string(),
        },
        _ => {
            warn!(execution = %execution.reference(), "Cannot compute execution duration");
            UNKNOWN_DURATION.to_string()
        }
    }
}

/// Link to the execution's page on the server.
pub fn execution_url(server_url: &str, execution: &PipelineExecution) -> String {
    format!(
        "{}/p/{}/pipeline/pipelines/{}/run/{}",
        server_url.trim_end_matches('/'),
        execution.spec.project_name,
        execution.spec.pipeline_name,
        execution.spec.run
    )
}

/// The summary sent when the pipeline does not configure its own message.
pub fn default_message(server_url: &str, execution: &PipelineExecution) -> String {
    let conditions = &execution.status.conditions;
    let outcome = if conditions.is_false(ConditionType::Built) {
        conditions.message(ConditionType::Built)
    } else {
        "Success"
    };
    let spec = &execution.spec;
    format!(
        "\nPipeline execution #{run} for {repo} repo ended in '{state}' state\n\
         Commit message: {commit}\n\
         Author: {author}\n\
         Git Ref URL: {link}\n\
         Pipeline execution URL: {url}\n\
         Event: {event}\n\
         Duration: {duration}\n\
         Message: {outcome}\n",
        run = spec.run,
        repo = repo_name_from_url(&spec.repository_url),
        state = state_str(execution),
        commit = spec.message,
        author = spec.author,
        link = spec.html_link,
        url = execution_url(server_url, execution),
        event = spec.event,
        duration = duration(execution),
        outcome = outcome,
    )
}

pub fn email_title(execution: &PipelineExecution) -> String {
    format!(
        "Pipeline #{} build for {} repo {}",
        execution.spec.run,
        repo_name_from_url(&execution.spec.repository_url),
        state_str(execution)
    )
}

/// Escapes text for the plain HTML body of email-like channels. Only
/// element content is produced, never attributes or markup templates.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escaped body with `<br>` line breaks.
pub fn html_body(text: &str) -> String {
    escape_html(text).replace('\n', "<br>\n")
}

/// Render the message for one channel.
pub fn render(body: &str, execution: &PipelineExecution, email_like: bool) -> Message {
    if email_like {
        Message {
            title: email_title(execution),
            content: html_body(body),
        }
    } else {
        Message {
            title: String::new(),
            content: body.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use conveyor_common::pipeline::{ExecutionState, PipelineExecutionSpec};
    use conveyor_common::ObjectMeta;

    fn execution() -> PipelineExecution {
        let mut exec = PipelineExecution {
            metadata: ObjectMeta::new("p-1", "demo-4"),
            spec: PipelineExecutionSpec {
                project_name: "c-1:p-1".to_string(),
                pipeline_name: "p-1:demo".to_string(),
                repository_url: "https://github.com/acme/widgets.git".to_string(),
                run: 4,
                message: "Fix flaky test".to_string(),
                author: "dev".to_string(),
                html_link: "https://github.com/acme/widgets/commit/abc".to_string(),
                event: "push".to_string(),
                ..Default::default()
            },
            status: Default::default(),
        };
        exec.status.execution_state = Some(ExecutionState::Success);
        exec
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/acme/widgets.git"), "acme/widgets");
        assert_eq!(repo_name_from_url("ssh://git@github.com/acme/widgets.git"), "acme/widgets");
        assert_eq!(
            repo_name_from_url("git@github.com:widgets.git"),
            "<git@github.com:widgets.git>"
        );
        assert_eq!(repo_name_from_url("not a url"), "<not a url>");
        assert_eq!(repo_name_from_url(""), "<>");
    }

    #[test]
    fn test_default_message() {
        let mut exec = execution();
        exec.status.started = Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap());
        exec.status.ended = Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 30).unwrap());

        let message = default_message("https://ci.example.com/", &exec);
        assert!(message.starts_with("\nPipeline execution #4 for acme/widgets repo ended in 'Success' state\n"));
        assert!(message.contains("Commit message: Fix flaky test\n"));
        assert!(message.contains(
            "Pipeline execution URL: https://ci.example.com/p/c-1:p-1/pipeline/pipelines/p-1:demo/run/4\n"
        ));
        assert!(message.contains("Duration: 1m 30s\n"));
        assert!(message.ends_with("Message: Success\n"));
    }

    #[test]
    fn test_default_message_unknown_duration_and_failure() {
        let mut exec = execution();
        exec.status.execution_state = Some(ExecutionState::Failed);
        exec.status.conditions.set_false(ConditionType::Built);
        exec.status
            .conditions
            .set_message(ConditionType::Built, "Got FAILED status in 'test' stage");

        let message = default_message("", &exec);
        assert!(message.contains("ended in 'Failed' state"));
        assert!(message.contains("Duration: <Unknown>\n"));
        assert!(message.contains("Message: Got FAILED status in 'test' stage\n"));
    }

    #[test]
    fn test_email_rendering() {
        let exec = execution();
        let message = render("a <b>\nc & d", &exec, true);
        assert_eq!(message.title, "Pipeline #4 build for acme/widgets repo Success");
        assert_eq!(message.content, "a &lt;b&gt;<br>\nc &amp; d");

        let plain = render("a <b>\nc", &exec, false);
        assert!(plain.title.is_empty());
        assert_eq!(plain.content, "a <b>\nc");
    }
}
