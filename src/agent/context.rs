use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One unit of contextual knowledge available to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub content:   String,
    /// Free-form tag: "system", "memory", "conversation", ...
    pub item_type: String,
}

impl ContextItem {
    pub fn new(item_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content:   content.into(),
            item_type: item_type.into(),
        }
    }
}

/// A context item together with its relevance to the current task.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item:  ContextItem,
    pub score: f64,
}

/// Token-overlap relevance in `0..=1`: the fraction of the task's words
/// that also appear in the item.
pub fn score_relevance(task: &str, content: &str) -> f64 {
    let task_words: HashSet<String> = words(task);
    if task_words.is_empty() {
        return 0.0;
    }
    let content_words: HashSet<String> = words(content);
    let overlap = task_words.intersection(&content_words).count();
    overlap as f64 / task_words.len() as f64
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Relevance-ranked context selection with a token budget.
///
/// Items scoring below `min_relevance_score` are dropped outright. If the
/// survivors exceed `max_tokens` (estimated as characters / 4), the lowest
/// scored items go first — except items whose type is in `preserve_types`,
/// which are never pruned.
#[derive(Debug, Clone)]
pub struct ContextSelector {
    pub min_relevance_score: f64,
    pub max_tokens:          usize,
    pub preserve_types:      HashSet<String>,
}

impl Default for ContextSelector {
    fn default() -> Self {
        Self {
            min_relevance_score: 0.1,
            max_tokens:          2000,
            preserve_types:      ["system".to_string()].into_iter().collect(),
        }
    }
}

fn estimated_tokens(items: &[ScoredItem]) -> usize {
    items.iter().map(|s| s.item.content.len()).sum::<usize>() / 4
}

impl ContextSelector {
    pub fn select(&self, task: &str, items: &[ContextItem]) -> Vec<ScoredItem> {
        let mut scored: Vec<ScoredItem> = items
            .iter()
            .map(|item| ScoredItem {
                score: score_relevance(task, &item.content),
                item:  item.clone(),
            })
            .filter(|scored| {
                scored.score >= self.min_relevance_score
                    || self.preserve_types.contains(&scored.item.item_type)
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        self.prune(scored)
    }

    /// Drop the lowest-scored prunable items until the estimate fits.
    fn prune(&self, mut scored: Vec<ScoredItem>) -> Vec<ScoredItem> {
        while estimated_tokens(&scored) > self.max_tokens {
            let victim = scored
                .iter()
                .enumerate()
                .rev()
                .find(|(_, s)| !self.preserve_types.contains(&s.item.item_type))
                .map(|(i, _)| i);
            match victim {
                Some(index) => {
                    scored.remove(index);
                }
                // Everything left is preserved; stop rather than violate
                // the preservation contract.
                None => break,
            }
        }
        scored
    }
}
