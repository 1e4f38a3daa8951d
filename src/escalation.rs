//! Structured human-intervention requests. An escalation is emitted as an
//! `escalation.raised` event on the [`crate::events::EventBus`] and is
//! also the payload handed to external sinks (terminal/webhook/chat),
//! which live outside this crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Blocking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationContext {
    pub pr_url: Option<String>,
    pub branch: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub severity: Severity,
    pub unit: String,
    pub title: String,
    pub message: String,
    pub context: EscalationContext,
}

impl Escalation {
    pub fn blocking(unit: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Blocking,
            unit: unit.into(),
            title: title.into(),
            message: message.into(),
            context: EscalationContext::default(),
        }
    }

    pub fn with_context(mut self, context: EscalationContext) -> Self {
        self.context = context;
        self
    }
}
