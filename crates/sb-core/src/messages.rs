//! User-facing copy of the bot.

pub const GREETING: &str = "Hi there! I'm securitybot. I'll reach out when one of our \
security alerts fires for something done from your account. Say `help` to see what I can do.";

pub const ALERT_INTRO: &str = "Hello! Our security monitoring flagged something done from \
your account and I'd like to double check it with you.";

pub const ACTION_PROMPT: &str = "Did you perform this action? Please reply *yes* or *no*. \
If yes, feel free to add a few words about why.";

pub const ACTION_PROMPT_RETRY: &str = "Sorry, I didn't catch that. Did you perform this action? \
Please start your reply with *yes* or *no*.";

pub const MFA_PERMISSION: &str = "Thanks! Would you be willing to confirm this with a Duo push? \
(*yes* / *no*)";

pub const MFA_PERMISSION_RETRY: &str = "Please answer *yes* to receive a Duo push or *no* to skip it.";

pub const MFA_SENT: &str = "Sent a Duo push to your device. Approve it when you see it.";

pub const MFA_FAILED: &str = "I couldn't send a Duo push right now, so I'll pass this on \
without it.";

pub const MFA_DENIED: &str = "The Duo push was denied. The security team will look into \
this alert.";

pub const MFA_SKIPPED: &str = "No problem, we'll skip the push.";

pub const ESCALATED: &str = "Thanks for letting us know. The security team has been \
notified and will follow up with you shortly.";

pub const TASK_DONE: &str = "Thanks, that's all I needed for this alert!";

pub const BLACKLISTED_COMMENT: &str = "user is blacklisted";

pub const UNKNOWN_USER_COMMENT: &str = "unknown user";

pub const HELP_HINT: &str = "I don't know that command. Say `help` for the list.";

pub const RATE_LIMITED: &str = "You're sending commands a bit fast; try again in a moment.";

pub const TEST_ALERT_TITLE: &str = "Test alert";

pub const TEST_ALERT_DESCRIPTION: &str = "This is a test alert you asked for with the `test` \
command. Answer it like a real one.";

pub const TEST_ALERT_REASON: &str = "requested via chat";

pub const IGNORE_NOTHING: &str = "There's no recently answered alert to ignore yet.";

pub const IGNORE_USAGE: &str = "Usage: `ignore <duration> [reason]`, e.g. `ignore 4h on call`. \
Durations look like `30m`, `4h`, `2d` (at most 7 days).";

pub const IGNORE_REASON_TOO_LONG: &str =
    "That reason is too long; keep it to 255 characters or fewer.";
