//! Prefix search over stored strings, used to detect emoji sequences
//! embedded in tokens.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PrefixTrie {
    children: HashMap<char, PrefixTrie>,
    terminal: bool,
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: &str) {
        let mut node = self;
        for c in entry.chars() {
            node = node.children.entry(c).or_default();
        }
        node.terminal = true;
    }

    /// Byte length of the first stored entry found while descending along
    /// `input`, or 0 when the walk ends without reaching one. An entry that
    /// is a prefix of another therefore shadows the longer entry.
    pub fn match_len(&self, input: &str) -> usize {
        let mut node = self;
        let mut consumed = 0;

        for c in input.chars() {
            match node.children.get(&c) {
                Some(child) => {
                    consumed += c.len_utf8();
                    if child.terminal {
                        return consumed;
                    }
                    node = child;
                }
                None => return 0,
            }
        }
        0
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_terminal_wins() {
        let mut trie = PrefixTrie::new();
        trie.add("🙂");
        trie.add("🙂🙃");

        // The shorter entry shadows the longer one on a shared path.
        assert_eq!(trie.match_len("🙂🙃x"), "🙂".len());
        assert_eq!(trie.match_len("🙂x"), "🙂".len());
        assert_eq!(trie.match_len("x🙂"), 0);
    }

    #[test]
    fn test_no_terminal_on_path_matches_nothing() {
        let mut trie = PrefixTrie::new();
        trie.add("abc");

        // Input exhausted before a terminal, or diverging mid-path.
        assert_eq!(trie.match_len("ab"), 0);
        assert_eq!(trie.match_len("abx"), 0);
        assert_eq!(trie.match_len("abcd"), 3);
    }

    #[test]
    fn test_empty_trie_matches_nothing() {
        let trie = PrefixTrie::new();
        assert_eq!(trie.match_len("anything"), 0);
        assert!(trie.is_empty());
    }
}
