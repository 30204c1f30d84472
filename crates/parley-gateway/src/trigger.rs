use anyhow::{Context, Result};
use parley_core::{ConversationKey, InboundMessage};
use regex::Regex;
use std::collections::HashMap;

use crate::config::{Config, TriggerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerDecision {
    /// Flush the conversation's batch now.
    ConsumeNow,
    /// Leave it to the timer.
    Defer,
}

#[derive(Debug)]
enum Rule {
    Always,
    Mention,
    Regex(Regex),
    Timer,
}

/// Per-conversation trigger rules, compiled once from config.
///
/// Unlisted group conversations use the mention rule; unlisted direct
/// conversations always respond.
#[derive(Debug)]
pub(crate) struct Triggers {
    agent_mention: String,
    mention_names: Vec<String>,
    rules: HashMap<ConversationKey, Rule>,
}

impl Triggers {
    pub(crate) fn from_config(config: &Config) -> Result<Self> {
        let mut rules = HashMap::new();
        for conversation in &config.conversations {
            let key: ConversationKey = conversation
                .r#match
                .parse()
                .with_context(|| format!("bad conversation key '{}'", conversation.r#match))?;

            let rule = match conversation.trigger {
                TriggerKind::Always => Rule::Always,
                TriggerKind::Mention => Rule::Mention,
                TriggerKind::Timer => Rule::Timer,
                TriggerKind::Regex => {
                    let pattern = conversation.trigger_regex.as_deref().with_context(|| {
                        format!("'{}' needs trigger_regex", conversation.r#match)
                    })?;
                    Rule::Regex(
                        Regex::new(pattern)
                            .with_context(|| format!("invalid trigger_regex '{pattern}'"))?,
                    )
                }
            };
            rules.insert(key, rule);
        }

        Ok(Self {
            agent_mention: format!("@{}", config.agent.id.to_lowercase()),
            mention_names: config
                .agent
                .mention_names
                .iter()
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
            rules,
        })
    }

    pub(crate) fn evaluate(&self, msg: &InboundMessage) -> TriggerDecision {
        let rule = self.rules.get(&msg.conversation);
        let respond = match rule {
            Some(Rule::Always) => true,
            Some(Rule::Timer) => false,
            Some(Rule::Regex(re)) => re.is_match(&msg.content),
            Some(Rule::Mention) => self.mentioned(&msg.content),
            None if msg.conversation.is_group() => self.mentioned(&msg.content),
            None => true,
        };

        if respond {
            TriggerDecision::ConsumeNow
        } else {
            TriggerDecision::Defer
        }
    }

    fn mentioned(&self, content: &str) -> bool {
        let lower = content.to_lowercase();
        lower.contains(&self.agent_mention)
            || self
                .mention_names
                .iter()
                .any(|name| lower.contains(name.as_str()))
    }
}
