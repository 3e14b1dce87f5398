//! Context-window pruning (spec.md §4.G, §9 design note "Sonnet-style
//! context pruning"). When the running history grows past the
//! solver's context window, the oldest ~30% of non-system messages are
//! dropped — but never by truncating an individual message, and never
//! by splitting a tool_call/tool_result pair across the kept/dropped
//! boundary. Implemented as an explicit filter + rebind over an
//! immutable slice, never in-place mutation, per the design note.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolCall => "tool_call",
            Role::ToolResult => "tool_result",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Messages that form a tool_call/tool_result pair share a `pair_id`
    /// so pruning can never keep one half and drop the other.
    pub pair_id: Option<u64>,
}

const DROP_FRACTION: f64 = 0.30;

/// Returns a new, pruned message list: every `Role::System` message is
/// always kept (this is where the initial instruction lives), and the
/// oldest ~30% of the remaining messages are dropped in whole
/// pair-respecting groups, oldest first.
pub fn prune_context(messages: &[Message]) -> Vec<Message> {
    let system_prefix: Vec<Message> = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .cloned()
        .collect();
    let rest = &messages[system_prefix.len()..];
    if rest.is_empty() {
        return system_prefix;
    }

    let groups = group_by_pair(rest);
    let target_drop = ((rest.len() as f64) * DROP_FRACTION).floor() as usize;

    let mut dropped = 0usize;
    let mut first_kept_group = 0usize;
    for (i, group) in groups.iter().enumerate() {
        if dropped >= target_drop {
            break;
        }
        dropped += group.len();
        first_kept_group = i + 1;
    }

    let mut out = system_prefix;
    for group in &groups[first_kept_group.min(groups.len())..] {
        out.extend(group.iter().cloned());
    }
    out
}

/// Groups consecutive messages that share a `pair_id` (a tool_call
/// immediately followed by its tool_result) into single units pruning
/// must keep or drop atomically. Messages with no `pair_id` form their
/// own singleton group.
fn group_by_pair(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        let joins_previous = message
            .pair_id
            .zip(groups.last().and_then(|g: &Vec<Message>| g.last()).and_then(|m| m.pair_id))
            .map(|(a, b)| a == b)
            .unwrap_or(false);
        if joins_previous {
            groups.last_mut().unwrap().push(message.clone());
        } else {
            groups.push(vec![message.clone()]);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: Role, content: &str, pair_id: Option<u64>) -> Message {
        Message {
            role,
            content: content.to_string(),
            pair_id,
        }
    }

    #[test]
    fn system_prefix_always_survives() {
        let messages = vec![
            msg(Role::System, "instructions", None),
            msg(Role::User, "old 1", None),
            msg(Role::User, "old 2", None),
            msg(Role::User, "old 3", None),
            msg(Role::User, "recent", None),
        ];
        let pruned = prune_context(&messages);
        assert_eq!(pruned[0].content, "instructions");
    }

    #[test]
    fn drops_oldest_non_system_messages_first() {
        let messages: Vec<Message> = (0..10).map(|i| msg(Role::User, &format!("m{i}"), None)).collect();
        let mut with_system = vec![msg(Role::System, "instructions", None)];
        with_system.extend(messages);

        let pruned = prune_context(&with_system);
        // 30% of 10 = 3 dropped, oldest first: m0, m1, m2
        assert!(!pruned.iter().any(|m| m.content == "m0"));
        assert!(!pruned.iter().any(|m| m.content == "m1"));
        assert!(pruned.iter().any(|m| m.content == "m9"));
    }

    #[test]
    fn never_splits_a_tool_call_result_pair() {
        let messages = vec![
            msg(Role::System, "instructions", None),
            msg(Role::ToolCall, "call-1", Some(1)),
            msg(Role::ToolResult, "result-1", Some(1)),
            msg(Role::User, "filler 1", None),
            msg(Role::User, "filler 2", None),
            msg(Role::User, "filler 3", None),
            msg(Role::User, "filler 4", None),
            msg(Role::User, "recent", None),
        ];
        let pruned = prune_context(&messages);
        let has_call = pruned.iter().any(|m| m.pair_id == Some(1) && m.role == Role::ToolCall);
        let has_result = pruned.iter().any(|m| m.pair_id == Some(1) && m.role == Role::ToolResult);
        assert_eq!(has_call, has_result, "pair must be kept or dropped together");
    }
}
