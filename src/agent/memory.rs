//! Memory state owned by a single run's Decision Agent. Never persisted;
//! reconstructed fresh at the start of every run.

use std::collections::VecDeque;

use crate::prelude::*;

/// One remembered step, used to render `message_history` memory blocks.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub observation: String,
    pub choices: Vec<String>,
    pub action: i64,
    pub reasoning: String,
}

/// How an [`super::AgentConfig`] wants memory handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    None,
    MessageHistory,
    Summary,
}

/// Memory configuration, as carried on [`super::AgentConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_summary_every")]
    pub summary_every: usize,
}

fn default_max_history() -> usize {
    5
}

fn default_summary_every() -> usize {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            kind: MemoryKind::None,
            max_history: default_max_history(),
            summary_every: default_summary_every(),
        }
    }
}

/// Per-run memory: a bounded window of recent entries, plus an optional
/// rolling summary of everything that aged out of the window.
#[derive(Debug, Default)]
pub struct Memory {
    config: MemoryConfig,
    entries: VecDeque<MemoryEntry>,
    summary: Option<String>,
    steps_since_summary: usize,
}

impl Memory {
    pub fn new(config: MemoryConfig) -> Self {
        Memory {
            config,
            entries: VecDeque::new(),
            summary: None,
            steps_since_summary: 0,
        }
    }

    /// Record a completed step. The caller is responsible for invoking
    /// [`Memory::due_for_summary`] and [`Memory::apply_summary`] around this
    /// when `kind == Summary`, since producing the summary itself requires
    /// an LLM call the `Memory` type has no access to.
    pub fn record(&mut self, entry: MemoryEntry) {
        if self.config.kind == MemoryKind::None {
            return;
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.config.max_history {
            self.entries.pop_front();
        }
        self.steps_since_summary += 1;
    }

    /// Is a new rolling summary due? Only meaningful for `summary` memory.
    pub fn due_for_summary(&self) -> bool {
        self.config.kind == MemoryKind::Summary
            && self.steps_since_summary >= self.config.summary_every
    }

    /// Install a freshly computed summary, replacing the previous one.
    pub fn apply_summary(&mut self, summary: String) {
        self.summary = Some(summary);
        self.steps_since_summary = 0;
    }

    /// Append a calculator-tool sentence to surface in the next block.
    pub fn append_note(&mut self, note: String) {
        if let Some(last) = self.entries.back_mut() {
            last.reasoning.push('\n');
            last.reasoning.push_str(&note);
        }
    }

    /// Raw text of the entries currently held, regardless of `kind`. Used
    /// to build the prompt for the secondary `complete` call that produces
    /// a rolling summary.
    pub fn pending_entries_text(&self) -> String {
        render_entries(&self.entries)
    }

    pub fn kind(&self) -> MemoryKind {
        self.config.kind
    }

    /// Render the memory block to inject into the next prompt, or `None`
    /// when memory is disabled or there's nothing to show yet.
    pub fn render_block(&self) -> Option<String> {
        match self.config.kind {
            MemoryKind::None => None,
            MemoryKind::MessageHistory => {
                if self.entries.is_empty() {
                    return None;
                }
                Some(render_entries(&self.entries))
            }
            MemoryKind::Summary => {
                let mut block = String::new();
                if let Some(summary) = &self.summary {
                    block.push_str(summary);
                    block.push('\n');
                }
                if !self.entries.is_empty() {
                    block.push_str(&render_entries(&self.entries));
                }
                if block.is_empty() { None } else { Some(block) }
            }
        }
    }
}

fn render_entries(entries: &VecDeque<MemoryEntry>) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "- at \"{}\" you chose #{} ({}); reasoning: {}",
                entry.observation,
                entry.action,
                entry
                    .choices
                    .get((entry.action - 1).max(0) as usize)
                    .map(String::as_str)
                    .unwrap_or("?"),
                entry.reasoning,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: i64) -> MemoryEntry {
        MemoryEntry {
            observation: "a room".to_owned(),
            choices: vec!["go north".to_owned(), "go south".to_owned()],
            action,
            reasoning: "seemed safest".to_owned(),
        }
    }

    #[test]
    fn none_memory_never_renders() {
        let mut memory = Memory::new(MemoryConfig {
            kind: MemoryKind::None,
            ..Default::default()
        });
        memory.record(entry(1));
        assert!(memory.render_block().is_none());
    }

    #[test]
    fn message_history_bounds_to_max_history() {
        let mut memory = Memory::new(MemoryConfig {
            kind: MemoryKind::MessageHistory,
            max_history: 2,
            ..Default::default()
        });
        memory.record(entry(1));
        memory.record(entry(2));
        memory.record(entry(1));
        let block = memory.render_block().unwrap();
        assert_eq!(block.lines().count(), 2);
    }

    #[test]
    fn summary_due_after_configured_steps() {
        let mut memory = Memory::new(MemoryConfig {
            kind: MemoryKind::Summary,
            max_history: 2,
            summary_every: 2,
        });
        memory.record(entry(1));
        assert!(!memory.due_for_summary());
        memory.record(entry(1));
        assert!(memory.due_for_summary());
        memory.apply_summary("so far, so good".to_owned());
        assert!(!memory.due_for_summary());
        assert!(memory.render_block().unwrap().starts_with("so far"));
    }
}
