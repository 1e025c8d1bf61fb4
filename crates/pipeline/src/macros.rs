//! Template macro substitution for preset bodies.
//!
//! Macros are fixed `{{name}}` tokens replaced with run-scoped values.
//! Unknown tokens are left in place so retrieval placeholders
//! (`{{kb ...}}`) survive untouched for the retrieval resolver.

use chrono::{DateTime, Local, Utc};

use crate::context::ChatContext;

/// Values available to macro expansion, snapshotted from the context
/// once per run.
pub struct MacroScope {
    pub char_name: String,
    pub user_name: String,
    pub persona: String,
    pub model_id: String,
    pub session_title: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Clock override for tests; `None` means the real clock.
    pub now: Option<DateTime<Local>>,
}

impl MacroScope {
    pub fn from_context(ctx: &ChatContext) -> Self {
        Self {
            char_name: ctx
                .agent
                .as_ref()
                .map(|a| a.name.clone())
                .unwrap_or_default(),
            user_name: ctx
                .profile
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "User".to_string()),
            persona: ctx
                .profile
                .as_ref()
                .map(|p| p.persona.clone())
                .unwrap_or_default(),
            model_id: ctx.model_id.clone(),
            session_title: ctx
                .session
                .as_ref()
                .and_then(|s| s.title.clone())
                .unwrap_or_default(),
            last_activity_at: ctx.session.as_ref().and_then(|s| s.last_activity_at),
            now: None,
        }
    }

    fn now(&self) -> DateTime<Local> {
        self.now.unwrap_or_else(Local::now)
    }

    fn idle_duration(&self) -> String {
        let Some(last) = self.last_activity_at else {
            return "a moment".to_string();
        };
        let elapsed = self.now().with_timezone(&Utc) - last;
        let minutes = elapsed.num_minutes().max(0);
        match minutes {
            0 => "less than a minute".to_string(),
            1 => "1 minute".to_string(),
            m if m < 60 => format!("{m} minutes"),
            m if m < 120 => "1 hour".to_string(),
            m if m < 1440 => format!("{} hours", m / 60),
            m if m < 2880 => "1 day".to_string(),
            m => format!("{} days", m / 1440),
        }
    }

    /// Expand all known macros in `text`.
    pub fn expand(&self, text: &str) -> String {
        if !text.contains("{{") {
            return text.to_string();
        }
        let now = self.now();
        text.replace("{{char}}", &self.char_name)
            .replace("{{user}}", &self.user_name)
            .replace("{{persona}}", &self.persona)
            .replace("{{model}}", &self.model_id)
            .replace("{{session}}", &self.session_title)
            .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
            .replace("{{time}}", &now.format("%H:%M").to_string())
            .replace("{{idle_duration}}", &self.idle_duration())
    }
}
