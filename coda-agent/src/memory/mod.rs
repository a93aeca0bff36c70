use crate::clients::providers;
use crate::clients::{Message, MessageRole};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const CHARS_PER_TOKEN: usize = 4;

/// Ordered conversation history with a message cap.
///
/// When the cap is exceeded the oldest non-system messages are dropped;
/// system messages are never pruned.
pub struct ConversationContext {
    messages: Vec<Message>,
    max_messages: usize,
    prune_count: usize,
    total_messages_pruned: usize,
    session_id: String,
    started_at: DateTime<Local>,
    started: Instant,
    provider: String,
    model: String,
}

/// Result of changing the message cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub old_limit: usize,
    pub new_limit: usize,
    pub before: usize,
    pub after: usize,
}

impl LimitChange {
    pub fn pruned(&self) -> usize {
        self.before - self.after
    }
}

impl ConversationContext {
    pub fn new(max_messages: usize, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            messages: Vec::new(),
            max_messages,
            prune_count: 0,
            total_messages_pruned: 0,
            session_id,
            started_at: Local::now(),
            started: Instant::now(),
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Changes the labels used for cost estimation. Messages are untouched.
    pub fn update_provider(&mut self, provider: impl Into<String>, model: impl Into<String>) {
        self.provider = provider.into();
        self.model = model.into();
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            self.prune();
        }
    }

    pub fn add_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.add_message(message);
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// `(message_count, user_turns, assistant_turns)`
    pub fn stats(&self) -> (usize, usize, usize) {
        let user = self.count_role(MessageRole::User);
        let assistant = self.count_role(MessageRole::Assistant);
        (self.messages.len(), user, assistant)
    }

    /// `(prune_count, total_messages_pruned)`
    pub fn pruning_stats(&self) -> (usize, usize) {
        (self.prune_count, self.total_messages_pruned)
    }

    /// Drops every message, optionally keeping a leading system prompt.
    pub fn clear(&mut self, keep_system_prompt: bool) {
        let system = match self.messages.first() {
            Some(first) if keep_system_prompt && first.role == MessageRole::System => Some(first.clone()),
            _ => None,
        };
        self.messages = system.into_iter().collect();
    }

    pub fn set_context_limit(&mut self, new_limit: usize) -> LimitChange {
        let old_limit = self.max_messages;
        let before = self.messages.len();
        self.max_messages = new_limit;
        if before > new_limit {
            self.prune();
        }
        LimitChange {
            old_limit,
            new_limit,
            before,
            after: self.messages.len(),
        }
    }

    fn count_role(&self, role: MessageRole) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    fn prune(&mut self) {
        let before = self.messages.len();
        debug!(current = before, max = self.max_messages, "Pruning old messages");

        let (system, others): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.role == MessageRole::System);

        let keep = self.max_messages.saturating_sub(system.len());
        let skip = others.len().saturating_sub(keep);
        self.messages = system;
        self.messages.extend(others.into_iter().skip(skip));

        let removed = before - self.messages.len();
        if removed > 0 {
            self.prune_count += 1;
            self.total_messages_pruned += removed;
        }
        info!(now = self.messages.len(), removed, "Pruned conversation");
    }

    pub fn detailed_stats(&self) -> ContextStats {
        self.detailed_stats_at(self.started.elapsed())
    }

    fn detailed_stats_at(&self, elapsed: Duration) -> ContextStats {
        let mut stats = ContextStats {
            total_messages: self.messages.len(),
            system: 0,
            user: 0,
            assistant: 0,
            tool_calls: 0,
            tool_results: 0,
            total_chars: 0,
            largest_message: 0,
            input_tokens: 0,
            output_tokens: 0,
            tool_usage: BTreeMap::new(),
            max_messages: self.max_messages,
            prune_count: self.prune_count,
            total_messages_pruned: self.total_messages_pruned,
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            elapsed,
            provider: self.provider.clone(),
            model: self.model.clone(),
            estimated_cost: 0.0,
        };

        for message in &self.messages {
            let chars = message.text().chars().count();
            stats.total_chars += chars;
            stats.largest_message = stats.largest_message.max(chars);
            let tokens = chars / CHARS_PER_TOKEN;

            match message.role {
                MessageRole::System => {
                    stats.system += 1;
                    stats.input_tokens += tokens;
                }
                MessageRole::User => {
                    stats.user += 1;
                    stats.input_tokens += tokens;
                }
                MessageRole::Tool => {
                    stats.tool_results += 1;
                    stats.input_tokens += tokens;
                }
                MessageRole::Assistant => {
                    stats.assistant += 1;
                    stats.output_tokens += tokens;
                    for call in message.tool_calls.iter().flatten() {
                        stats.tool_calls += 1;
                        *stats.tool_usage.entry(call.name.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        stats.estimated_cost =
            providers::estimate_cost(&self.provider, stats.input_tokens, stats.output_tokens);
        stats
    }
}

/// Snapshot rendered by `/stats`.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub total_messages: usize,
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool_calls: usize,
    pub tool_results: usize,
    pub total_chars: usize,
    pub largest_message: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Calls per tool name, sorted by name.
    pub tool_usage: BTreeMap<String, usize>,
    pub max_messages: usize,
    pub prune_count: usize,
    pub total_messages_pruned: usize,
    pub session_id: String,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub provider: String,
    pub model: String,
    pub estimated_cost: f64,
}

impl ContextStats {
    /// Rough token count: one token per four characters, summed per message.
    pub fn estimated_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn usage_percent(&self) -> f64 {
        if self.max_messages == 0 {
            return 0.0;
        }
        self.total_messages as f64 / self.max_messages as f64 * 100.0
    }

    fn per_minute(&self, count: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            count as f64 / secs * 60.0
        } else {
            0.0
        }
    }

    fn cost_display(&self) -> String {
        match providers::lookup(&self.provider) {
            Some(p) if p.is_local() => "$0.00 USD (local/free)".to_string(),
            _ => format!("${:.2} USD", self.estimated_cost),
        }
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{} {}", count, word)
    } else {
        format!("{} {}s", count, word)
    }
}

fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "━".repeat(45);
        let (avg_chars, avg_tokens) = if self.total_messages > 0 {
            (
                self.total_chars / self.total_messages,
                self.estimated_tokens() / self.total_messages,
            )
        } else {
            (0, 0)
        };
        let secs = self.elapsed.as_secs();

        writeln!(f, "{}", rule)?;
        writeln!(f, "Conversation Statistics")?;
        writeln!(f, "{}", rule)?;
        writeln!(f)?;
        writeln!(f, "Messages:")?;
        writeln!(f, "  • Total: {} messages", self.total_messages)?;
        writeln!(f, "  • System: {}", plural(self.system, "message"))?;
        writeln!(f, "  • User: {}", plural(self.user, "message"))?;
        writeln!(f, "  • Assistant: {}", plural(self.assistant, "message"))?;
        writeln!(f, "  • Tool calls: {}", plural(self.tool_calls, "call"))?;
        writeln!(f, "  • Tool results: {}", plural(self.tool_results, "result"))?;
        writeln!(f, "  • Average length: {} chars/message", avg_chars)?;
        writeln!(f, "  • Largest message: {} chars", thousands(self.largest_message))?;
        writeln!(f)?;
        writeln!(f, "Context Size:")?;
        writeln!(f, "  • Characters: {} chars", thousands(self.total_chars))?;
        writeln!(f, "  • Estimated tokens: ~{} tokens", thousands(self.estimated_tokens()))?;
        writeln!(f, "  • Average tokens/message: ~{} tokens", avg_tokens)?;
        writeln!(f, "  • Context limit: {} messages", self.max_messages)?;
        writeln!(f, "  • Usage: {:.1}% of message limit", self.usage_percent())?;
        writeln!(f)?;
        writeln!(f, "Activity:")?;
        writeln!(f, "  • Message rate: {:.1} messages/min", self.per_minute(self.total_messages))?;
        writeln!(f, "  • Token rate: ~{:.0} tokens/min", self.per_minute(self.estimated_tokens()))?;
        writeln!(
            f,
            "  • Context pruned: {} ({} messages removed)",
            plural(self.prune_count, "time"),
            self.total_messages_pruned
        )?;
        writeln!(f)?;

        if !self.tool_usage.is_empty() {
            writeln!(f, "Tool Usage:")?;
            for (tool, count) in &self.tool_usage {
                writeln!(f, "  • {}: {}", tool, plural(*count, "call"))?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Session:")?;
        writeln!(f, "  • Session ID: {}", self.session_id)?;
        writeln!(f, "  • Started: {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "  • Duration: {}m {}s", secs / 60, secs % 60)?;
        writeln!(f, "  • Provider: {}", self.provider)?;
        writeln!(f, "  • Model: {}", self.model)?;
        writeln!(f)?;
        writeln!(f, "Cost Estimate:")?;
        writeln!(f, "  • Input tokens: ~{} tokens", thousands(self.input_tokens))?;
        writeln!(f, "  • Output tokens: ~{} tokens", thousands(self.output_tokens))?;
        write!(f, "  • Estimated cost: {}", self.cost_display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ToolCall;
    use rstest::rstest;

    fn context(max: usize) -> ConversationContext {
        ConversationContext::new(max, "openai", "gpt-4o-mini")
    }

    #[test]
    fn test_pruning_keeps_system_and_recent() {
        let mut ctx = context(5);
        ctx.add_message(Message::system("sys"));
        for i in 0..10 {
            ctx.add_message(Message::user(format!("u{}", i)));
        }

        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx.messages()[0].role, MessageRole::System);
        let texts: Vec<&str> = ctx.messages()[1..].iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["u6", "u7", "u8", "u9"]);
        assert_eq!(ctx.pruning_stats(), (6, 6));
    }

    #[test]
    fn test_pruning_with_only_system_messages_over_limit() {
        let mut ctx = context(2);
        ctx.add_messages([
            Message::system("a"),
            Message::system("b"),
            Message::user("u"),
            Message::system("c"),
        ]);
        assert!(ctx.messages().iter().all(|m| m.role == MessageRole::System));
        assert_eq!(ctx.len(), 3);
    }

    #[rstest]
    #[case(50, 30, 30, 0)]
    #[case(50, 60, 50, 10)]
    #[case(10, 10, 10, 0)]
    fn test_length_never_exceeds_limit(
        #[case] limit: usize,
        #[case] added: usize,
        #[case] expected_len: usize,
        #[case] expected_pruned: usize,
    ) {
        let mut ctx = context(limit);
        ctx.add_messages((0..added).map(|i| Message::user(i.to_string())));
        assert_eq!(ctx.len(), expected_len);
        assert_eq!(ctx.pruning_stats().1, expected_pruned);
    }

    #[test]
    fn test_set_context_limit_prunes_immediately() {
        let mut ctx = context(50);
        ctx.add_message(Message::system("sys"));
        ctx.add_messages((0..20).map(|i| Message::user(i.to_string())));

        let change = ctx.set_context_limit(10);
        assert_eq!(change.old_limit, 50);
        assert_eq!(change.before, 21);
        assert_eq!(change.after, 10);
        assert_eq!(change.pruned(), 11);
        assert_eq!(ctx.messages()[0].role, MessageRole::System);
        assert_eq!(ctx.messages()[9].text(), "19");

        let change = ctx.set_context_limit(100);
        assert_eq!(change.pruned(), 0);
        assert_eq!(ctx.max_messages(), 100);
    }

    #[test]
    fn test_clear_keeps_leading_system_prompt() {
        let mut ctx = context(10);
        ctx.add_messages([Message::system("sys"), Message::user("hi")]);
        ctx.clear(true);
        assert_eq!(ctx.len(), 1);
        ctx.clear(false);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_detailed_stats_counts() {
        let mut ctx = context(10);
        ctx.add_messages([
            Message::system("12345678"),
            Message::user("abcd"),
            Message::assistant_with_tools(
                None,
                vec![
                    ToolCall::new("1", "read_file", "{}"),
                    ToolCall::new("2", "list_files", "{}"),
                ],
            ),
            Message::tool_result("1", "read_file", "x".repeat(40)),
            Message::tool_result("2", "list_files", "y"),
            Message::assistant_with_tools(None, vec![ToolCall::new("3", "read_file", "{}")]),
            Message::assistant("done, all good"),
        ]);

        let stats = ctx.detailed_stats_at(Duration::from_secs(60));
        assert_eq!(stats.total_messages, 7);
        assert_eq!((stats.system, stats.user, stats.assistant), (1, 1, 3));
        assert_eq!(stats.tool_calls, 3);
        assert_eq!(stats.tool_results, 2);
        assert_eq!(stats.largest_message, 40);
        assert_eq!(stats.input_tokens, 2 + 1 + 10);
        assert_eq!(stats.output_tokens, 3);
        assert_eq!(
            stats.tool_usage.into_iter().collect::<Vec<_>>(),
            vec![("list_files".to_string(), 1), ("read_file".to_string(), 2)]
        );
        assert_eq!(ctx.stats(), (7, 1, 3));
    }

    #[test]
    fn test_stats_display_for_local_provider() {
        let mut ctx = ConversationContext::new(4, "ollama", "qwen2.5:14b");
        ctx.add_message(Message::user("hello there"));
        let text = ctx.detailed_stats_at(Duration::from_secs(125)).to_string();
        assert!(text.contains("  • User: 1 message\n"));
        assert!(text.contains("  • Usage: 25.0% of message limit"));
        assert!(text.contains("  • Duration: 2m 5s"));
        assert!(text.ends_with("Estimated cost: $0.00 USD (local/free)"));
        assert!(!text.contains("Tool Usage:"));
        assert!(text.contains(&format!("Session ID: {}", ctx.session_id())));
    }

    #[test]
    fn test_cost_for_paid_provider() {
        let mut ctx = ConversationContext::new(10, "anthropic", "claude");
        ctx.add_message(Message::user("x".repeat(4_000_000)));
        let stats = ctx.detailed_stats_at(Duration::ZERO);
        assert!((stats.estimated_cost - 3.0).abs() < 1e-9);
        assert!(stats.to_string().ends_with("Estimated cost: $3.00 USD"));
        assert!(stats.to_string().contains("Characters: 4,000,000 chars"));
    }

    #[rstest]
    #[case(0, "0")]
    #[case(999, "999")]
    #[case(1000, "1,000")]
    #[case(1234567, "1,234,567")]
    fn test_thousands(#[case] n: usize, #[case] expected: &str) {
        assert_eq!(thousands(n), expected);
    }

    #[test]
    fn test_update_provider_keeps_messages() {
        let mut ctx = context(10);
        ctx.add_message(Message::user("hi"));
        ctx.update_provider("anthropic", "claude-3-5-sonnet-20241022");
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.detailed_stats().provider, "anthropic");
    }
}
