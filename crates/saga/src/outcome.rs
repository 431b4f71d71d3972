/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The message changed state and staged its follow-up events.
    Applied,
    /// The idempotency ledger already held the message; nothing was done.
    Duplicate,
    /// The message was recorded but required no change.
    Ignored,
    /// The message could not be applied and its effects were compensated.
    Compensated,
}

impl HandlerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Applied => "applied",
            HandlerOutcome::Duplicate => "duplicate",
            HandlerOutcome::Ignored => "ignored",
            HandlerOutcome::Compensated => "compensated",
        }
    }
}
