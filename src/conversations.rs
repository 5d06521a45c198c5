//! Local copy of the conversation list, kept eventually consistent with the
//! server by applying live events in arrival order and by periodic reloads.

use crate::events::LiveEvent;
use crate::model::ConversationSummary;

/// Conversation list ordered newest activity first.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    entries: Vec<ConversationSummary>,
    needs_refresh: bool,
    applied: u64,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.entries.iter().find(|c| c.conversation_id == conversation_id)
    }

    /// Whether local state is known to lag the server.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn mark_stale(&mut self) {
        self.needs_refresh = true;
    }

    /// Number of events applied since creation.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Replace the whole list with a fresh server listing.
    pub fn replace_all(&mut self, mut entries: Vec<ConversationSummary>) {
        entries.sort_by(|a, b| {
            b.activity()
                .partial_cmp(&a.activity())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.entries = entries;
        self.needs_refresh = false;
    }

    fn position(&self, conversation_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|c| c.conversation_id == conversation_id)
    }

    fn move_to_front(&mut self, idx: usize) {
        if idx > 0 {
            let entry = self.entries.remove(idx);
            self.entries.insert(0, entry);
        }
    }

    /// Apply one event. Returns `true` when the list should be reloaded from
    /// the server because the event carried less than a full row.
    ///
    /// Repeating an event leaves the list as it was after the first time.
    pub fn apply(&mut self, event: &LiveEvent) -> bool {
        self.applied += 1;
        let refresh = match event {
            LiveEvent::ConversationCreated { conversation_id } => {
                if self.position(conversation_id).is_none() {
                    self.entries.insert(0, ConversationSummary::new(conversation_id.clone()));
                }
                true
            }
            LiveEvent::ConversationDeleted { conversation_id } => {
                self.entries.retain(|c| &c.conversation_id != conversation_id);
                false
            }
            LiveEvent::MessageAdded { conversation_id, .. } => {
                match self.position(conversation_id) {
                    Some(idx) => self.move_to_front(idx),
                    None => self.entries.insert(0, ConversationSummary::new(conversation_id.clone())),
                }
                true
            }
            LiveEvent::MessageEdited { .. } => false,
            LiveEvent::SummaryUpdated {
                conversation_id,
                summary,
            } => match self.position(conversation_id) {
                Some(idx) => {
                    self.entries[idx].summary = Some(summary.clone());
                    false
                }
                None => true,
            },
        };
        if refresh {
            self.needs_refresh = true;
        }
        refresh
    }
}
