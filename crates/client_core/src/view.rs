use shared::domain::Message;
use storage::Subscription;
use url::Url;

pub const NO_LABEL: &str = "No Label";
pub const OTHER_DOMAIN: &str = "Other";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGroup {
    pub name: String,
    pub messages: Vec<Message>,
}

/// Read-only projections over one ordered conversation snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    messages: Vec<Message>,
}

impl ConversationView {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages carrying a link, in conversation order.
    pub fn links(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| extract_link(&m.content).is_some())
            .cloned()
            .collect()
    }

    /// Link-bearing messages grouped by site name, e.g. `"Google"` for
    /// `https://mail.google.com/x`. Groups keep first-appearance order.
    pub fn group_by_domain(&self) -> Vec<MessageGroup> {
        group_in_order(self.messages.iter().filter_map(|message| {
            extract_link(&message.content).map(|link| (domain_name(link), message))
        }))
    }

    /// All messages grouped by exact label; unlabeled ones go under [`NO_LABEL`].
    pub fn group_by_label(&self) -> Vec<MessageGroup> {
        group_in_order(self.messages.iter().map(|message| {
            let name = message.label.as_deref().unwrap_or(NO_LABEL).to_string();
            (name, message)
        }))
    }

    /// Case-insensitive substring match on content or label. A blank query
    /// matches everything.
    pub fn filter(&self, query: &str) -> Vec<Message> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.messages.clone();
        }
        self.messages
            .iter()
            .filter(|m| {
                m.content.to_lowercase().contains(&needle)
                    || m
                        .label
                        .as_deref()
                        .is_some_and(|label| label.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }
}

/// First whitespace-separated token that looks like a link.
pub fn extract_link(content: &str) -> Option<&str> {
    content.split_whitespace().find(|token| {
        token.starts_with("http://") || token.starts_with("https://") || token.starts_with("www.")
    })
}

/// Second-to-last host label with its first letter upper-cased, or
/// [`OTHER_DOMAIN`] when the link has no parsable host.
pub fn domain_name(link: &str) -> String {
    let candidate = if link.starts_with("www.") {
        format!("http://{link}")
    } else {
        link.to_string()
    };
    let Ok(parsed) = Url::parse(&candidate) else {
        return OTHER_DOMAIN.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return OTHER_DOMAIN.to_string();
    };
    let host = host.strip_prefix("www.").unwrap_or(host);
    let segments: Vec<&str> = host.split('.').filter(|s| !s.is_empty()).collect();
    let name = match segments.len() {
        0 => return OTHER_DOMAIN.to_string(),
        1 => segments[0],
        n => segments[n - 2],
    };
    capitalize(name)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn group_in_order<'a>(items: impl Iterator<Item = (String, &'a Message)>) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();
    for (name, message) in items {
        match groups.iter_mut().find(|group| group.name == name) {
            Some(group) => group.messages.push(message.clone()),
            None => groups.push(MessageGroup {
                name,
                messages: vec![message.clone()],
            }),
        }
    }
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub query: String,
    pub messages: Vec<Message>,
    pub by_domain: Vec<MessageGroup>,
    pub by_label: Vec<MessageGroup>,
}

impl ViewSnapshot {
    /// Grouping applies to the filtered messages.
    pub fn compute(messages: &[Message], query: &str) -> Self {
        let filtered = ConversationView::new(messages.to_vec()).filter(query);
        let view = ConversationView::new(filtered);
        Self {
            query: query.to_string(),
            by_domain: view.group_by_domain(),
            by_label: view.group_by_label(),
            messages: view.messages,
        }
    }
}

/// A [`ConversationView`] kept current by a store subscription.
pub struct LiveConversationView {
    subscription: Subscription,
    query: String,
    latest: Vec<Message>,
}

impl LiveConversationView {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            query: String::new(),
            latest: Vec::new(),
        }
    }

    /// Waits for the next store change and recomputes. `None` once closed.
    pub async fn next(&mut self) -> Option<ViewSnapshot> {
        self.latest = self.subscription.next_snapshot().await?;
        Some(self.current())
    }

    pub fn set_query(&mut self, query: impl Into<String>) -> ViewSnapshot {
        self.query = query.into();
        self.current()
    }

    pub fn current(&self) -> ViewSnapshot {
        ViewSnapshot::compute(&self.latest, &self.query)
    }

    pub fn close(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
