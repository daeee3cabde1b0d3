//! Formatting utilities (Slack mrkdwn for alerts, reports and escalations).

use chrono::{DateTime, Utc};

use crate::{tasker::Task, utils::truncate_chars};

const MAX_FIELD_CHARS: usize = 1500;

/// Escape the three control characters of Slack mrkdwn.
///
/// Slack treats `<…>` as links/mentions; everything else is literal.
pub fn escape_mrkdwn(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Inline-code a user-provided value without letting it close the span.
pub fn code_span(text: &str) -> String {
    let cleaned = escape_mrkdwn(text).replace('`', "'");
    format!("`{cleaned}`")
}

/// Block-quote a possibly multi-line value.
pub fn quote_block(text: &str) -> String {
    escape_mrkdwn(text)
        .lines()
        .map(|l| format!("> {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn link(url: &str, label: &str) -> String {
    let url = url.trim();
    if url.starts_with("https://") || url.starts_with("http://") {
        // `|` separates url and label inside `<…>`.
        format!("<{}|{}>", url.replace('|', "%7C"), escape_mrkdwn(label))
    } else {
        escape_mrkdwn(url)
    }
}

/// Alert body sent to the alerted user.
pub fn format_alert(task: &Task) -> String {
    let mut lines = vec![
        format!("*{}*", escape_mrkdwn(&task.title)),
        quote_block(&truncate_chars(&task.description, MAX_FIELD_CHARS)),
        format!("_Fired at {}_", timestamp(task.event_time)),
    ];
    if !task.url.trim().is_empty() {
        lines.push(format!("More info: {}", link(&task.url, "details")));
    }
    lines.join("\n")
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

/// Summary posted to the reporting channel when a user finished answering.
pub fn format_report(task: &Task) -> String {
    let icon = if task.performed && task.authenticated {
        ":white_check_mark:"
    } else if task.performed {
        ":grey_question:"
    } else {
        ":rotating_light:"
    };

    let mut lines = vec![
        format!(
            "{icon} *{}* responded to *{}*",
            escape_mrkdwn(task.username.as_str()),
            escape_mrkdwn(&task.title)
        ),
        format!(
            "Performed: {} | Authenticated: {}",
            yes_no(task.performed),
            yes_no(task.authenticated)
        ),
    ];
    if !task.comment.trim().is_empty() {
        lines.push(quote_block(&truncate_chars(&task.comment, MAX_FIELD_CHARS)));
    }
    lines.push(format!("Alert id: {}", code_span(task.hash.as_str())));
    lines.join("\n")
}

/// Message for an escalation contact when the alerted user went quiet.
pub fn format_escalation(task: &Task, now: DateTime<Utc>) -> String {
    let waited = crate::utils::format_duration(task.elapsed(now));
    format!(
        ":alarm_clock: *{}* has not answered the alert *{}* for {waited}.\n{}\nAlert id: {}",
        escape_mrkdwn(task.username.as_str()),
        escape_mrkdwn(&task.title),
        quote_block(&truncate_chars(&task.description, MAX_FIELD_CHARS)),
        code_span(task.hash.as_str())
    )
}

/// Notice for the reporting channel about an alert nobody can answer.
pub fn format_unknown_user(task: &Task) -> String {
    format!(
        ":warning: Alert *{}* is for {}, who is not in the workspace. Closing it for manual review.\nAlert id: {}",
        escape_mrkdwn(&task.title),
        code_span(task.username.as_str()),
        code_span(task.hash.as_str())
    )
}
