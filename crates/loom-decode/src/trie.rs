//! Speaker-name trie
//!
//! At the start of a line the decoder may only emit tokens that spell one of
//! the speakers already present in the scene, followed by the `:` separator.
//! The trie tracks the position inside the name being written and keeps a
//! short history of completed names to weight the choice between speakers.

use crate::model::{LanguageModel, TokenId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Completed names remembered for preference weighting
pub const HISTORY_LEN: usize = 10;

/// Outcome of feeding one token to the trie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieStep {
    /// Not at a line start; the token is unconstrained
    Inactive,
    /// Still inside a known name
    Partial,
    /// Separator consumed; a whole known name was written
    Complete,
    /// Token left the trie; constraint dropped until the next line
    Mismatch,
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: BTreeMap<TokenId, usize>,
}

/// Ordered trie over token ids
#[derive(Debug, Clone)]
pub struct CharacterTrie {
    nodes: Vec<Node>,
    separator: TokenId,
    cursor: usize,
    active: bool,
    current: Vec<TokenId>,
    history: VecDeque<Vec<TokenId>>,
    coefficient: f32,
}

impl CharacterTrie {
    /// Build from already tokenized names; each is terminated by `separator`
    #[must_use]
    pub fn new(names: &[Vec<TokenId>], separator: TokenId, coefficient: f32) -> Self {
        let mut trie = Self {
            nodes: vec![Node::default()],
            separator,
            cursor: 0,
            active: false,
            current: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_LEN),
            coefficient,
        };
        for name in names.iter().filter(|n| !n.is_empty()) {
            trie.insert(name);
        }
        trie
    }

    /// Tokenize names with the model's tokenizer
    ///
    /// Returns `None` when there is no usable name or `:` does not tokenize.
    pub fn from_names<'a, M, I>(model: &M, names: I, coefficient: f32) -> Option<Self>
    where
        M: LanguageModel + ?Sized,
        I: IntoIterator<Item = &'a str>,
    {
        let separator = *model.tokenize(":").last()?;
        let encoded: Vec<Vec<TokenId>> = names
            .into_iter()
            .map(|name| model.tokenize(name))
            .filter(|tokens| !tokens.is_empty())
            .collect();
        if encoded.is_empty() {
            return None;
        }
        Some(Self::new(&encoded, separator, coefficient))
    }

    fn insert(&mut self, name: &[TokenId]) {
        let mut node = 0;
        for &token in name.iter().chain(std::iter::once(&self.separator)) {
            node = match self.nodes[node].children.get(&token) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[node].children.insert(token, child);
                    child
                }
            };
        }
    }

    /// A new line begins; constrain from the root
    pub fn begin_line(&mut self) {
        self.cursor = 0;
        self.current.clear();
        self.active = true;
    }

    /// Is the constraint currently applied?
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Tokens that legally continue the current position
    #[must_use]
    pub fn next_allowed(&self) -> BTreeSet<TokenId> {
        if !self.active {
            return BTreeSet::new();
        }
        self.nodes[self.cursor].children.keys().copied().collect()
    }

    /// Allowed tokens with their preference weights, `None` when inactive
    ///
    /// A speaker who appeared recently gets a smaller boost than one who has
    /// been silent: weight is `coefficient^(HISTORY_LEN - last_seen)` with
    /// `last_seen = -1` for names not in the history.
    #[must_use]
    pub fn weighted_allowed(&self) -> Option<BTreeMap<TokenId, f32>> {
        if !self.active {
            return None;
        }
        let weights = self.nodes[self.cursor]
            .children
            .keys()
            .map(|&token| (token, self.weight(token)))
            .collect();
        Some(weights)
    }

    fn weight(&self, token: TokenId) -> f32 {
        let mut prefix = self.current.clone();
        prefix.push(token);
        let last_seen = self
            .history
            .iter()
            .rposition(|name| name.starts_with(&prefix))
            .and_then(|i| i32::try_from(i).ok())
            .unwrap_or(-1);
        let exponent = i32::try_from(HISTORY_LEN).unwrap_or(10) - last_seen;
        self.coefficient.powi(exponent)
    }

    /// Feed one generated token
    pub fn advance(&mut self, token: TokenId) -> TrieStep {
        if !self.active {
            return TrieStep::Inactive;
        }

        match self.nodes[self.cursor].children.get(&token) {
            Some(_) if token == self.separator => {
                let name = std::mem::take(&mut self.current);
                self.remember(name);
                self.reset();
                TrieStep::Complete
            }
            Some(&child) => {
                self.cursor = child;
                self.current.push(token);
                TrieStep::Partial
            }
            None => {
                self.reset();
                TrieStep::Mismatch
            }
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.current.clear();
        self.active = false;
    }

    fn remember(&mut self, name: Vec<TokenId>) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(name);
    }

    /// Completed names, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Vec<TokenId>> {
        self.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEP: TokenId = 58;

    fn trie() -> CharacterTrie {
        // "AB", "AC", "D"
        CharacterTrie::new(&[vec![1, 2], vec![1, 3], vec![4]], SEP, 2.0)
    }

    #[test]
    fn inactive_until_line_start() {
        let mut t = trie();
        assert!(t.next_allowed().is_empty());
        assert_eq!(t.advance(1), TrieStep::Inactive);
        t.begin_line();
        assert_eq!(t.next_allowed(), BTreeSet::from([1, 4]));
    }

    #[test]
    fn walks_a_name_to_completion() {
        let mut t = trie();
        t.begin_line();
        assert_eq!(t.advance(1), TrieStep::Partial);
        assert_eq!(t.next_allowed(), BTreeSet::from([2, 3]));
        assert_eq!(t.advance(3), TrieStep::Partial);
        assert_eq!(t.next_allowed(), BTreeSet::from([SEP]));
        assert_eq!(t.advance(SEP), TrieStep::Complete);
        assert!(!t.is_active());
        assert_eq!(t.history(), vec![vec![1, 3]]);
    }

    #[test]
    fn mismatch_drops_constraint() {
        let mut t = trie();
        t.begin_line();
        assert_eq!(t.advance(9), TrieStep::Mismatch);
        assert!(!t.is_active());
        assert!(t.history().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut t = trie();
        for _ in 0..(HISTORY_LEN + 5) {
            t.begin_line();
            t.advance(4);
            t.advance(SEP);
        }
        assert_eq!(t.history().len(), HISTORY_LEN);
    }

    #[test]
    fn silent_speakers_weigh_more() {
        let mut t = trie();
        t.begin_line();
        t.advance(4);
        t.advance(SEP);
        t.begin_line();
        let weights = t.weighted_allowed().unwrap();
        // "D" spoke last (index 0), "A*" never did
        assert!(weights[&1] > weights[&4]);
        assert!((weights[&1] - 2f32.powi(11)).abs() < 1.0);
        assert!((weights[&4] - 2f32.powi(10)).abs() < 1.0);
    }

    #[test]
    fn empty_names_are_ignored() {
        let mut t = CharacterTrie::new(&[vec![]], SEP, 2.0);
        t.begin_line();
        assert!(t.next_allowed().is_empty());
    }
}
