//! In-process memory store.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;

use super::MemoryStore;

const DEFAULT_MAX_RESULTS: usize = 3;

/// Excerpt store ranked by word overlap with the query. Lost on exit.
#[derive(Debug)]
pub struct VolatileMemory {
    entries: RwLock<Vec<String>>,
    max_results: usize,
}

impl Default for VolatileMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatileMemory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_entries(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let memory = Self::new();
        for entry in entries {
            memory.remember(entry);
        }
        memory
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    /// Stores an excerpt.
    pub fn remember(&self, entry: impl Into<String>) {
        match self.entries.write() {
            Ok(mut entries) => entries.push(entry.into()),
            Err(poisoned) => poisoned.into_inner().push(entry.into()),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rank(&self, query: &str) -> Vec<String> {
        let query_words = words(query);
        if query_words.is_empty() {
            return Vec::new();
        }

        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut scored: Vec<(usize, usize, &String)> = entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let score = words(entry).intersection(&query_words).count();
                (score > 0).then_some((score, position, entry))
            })
            .collect();

        // Highest overlap first; newer entries win ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored
            .into_iter()
            .take(self.max_results)
            .map(|(_, _, entry)| entry.clone())
            .collect()
    }
}

/// Lowercased alphanumeric words of at least three characters.
fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryStore for VolatileMemory {
    async fn retrieve(&self, query: &str) -> Vec<String> {
        let excerpts = self.rank(query);
        tracing::debug!(query_chars = query.len(), hits = excerpts.len(), "memory lookup");
        excerpts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_by_word_overlap() {
        let memory = VolatileMemory::with_entries([
            "parse csv files using a csv module",
            "add two numbers and print the sum",
            "print numbers from a csv file",
        ]);

        let hits = memory.retrieve("print the sum of two numbers").await;

        assert_eq!(hits[0], "add two numbers and print the sum");
        assert_eq!(hits[1], "print numbers from a csv file");
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn unrelated_or_empty_queries_return_nothing() {
        let memory = VolatileMemory::with_entries(["deploy the web server"]);

        assert!(tokio_test::block_on(memory.retrieve("sort a list")).is_empty());
        assert!(tokio_test::block_on(memory.retrieve("")).is_empty());
    }

    #[tokio::test]
    async fn respects_max_results_and_prefers_newer_ties() {
        let memory = VolatileMemory::new().with_max_results(2);
        memory.remember("numbers one");
        memory.remember("numbers two");
        memory.remember("numbers three");

        let hits = memory.retrieve("numbers").await;

        assert_eq!(hits, vec!["numbers three", "numbers two"]);
        assert_eq!(memory.len(), 3);
    }
}
