use std::collections::HashMap;

/// Trie for domain suffix scope matching.
///
/// Domains are inserted in reverse-label order, e.g. "www.example.com"
/// is stored as ["com", "example", "www"]. A terminal node covers every
/// name below it, so inserting a more specific suffix under an existing
/// terminal is a no-op and inserting a broader suffix drops the subtree.
/// Inserting "." marks the root terminal and matches every name.
#[derive(Debug, Default)]
pub struct DomainTrie {
    root: TrieNode,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminal: bool,
}

/// Split a domain into lowercase labels, TLD first, skipping blank labels.
fn reversed_labels(domain: &str) -> impl Iterator<Item = String> + '_ {
    domain
        .split('.')
        .rev()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_lowercase)
}

impl DomainTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain suffix into the scope set.
    pub fn insert(&mut self, domain: &str) {
        let mut node = &mut self.root;
        for label in reversed_labels(domain) {
            if node.terminal {
                return;
            }
            node = node.children.entry(label).or_default();
        }
        node.terminal = true;
        node.children.clear();
    }

    /// Whether `domain` equals or is a subdomain of any inserted suffix.
    pub fn contains(&self, domain: &str) -> bool {
        let mut node = &self.root;
        if node.terminal {
            return true;
        }
        for label in reversed_labels(domain) {
            match node.children.get(&label) {
                Some(child) if child.terminal => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    /// List the terminal suffixes as fully qualified names ("." for the root).
    pub fn format(&self) -> Vec<String> {
        let mut out = Vec::new();
        Self::collect(&self.root, String::new(), &mut out);
        out.sort();
        out
    }

    fn collect(node: &TrieNode, suffix: String, out: &mut Vec<String>) {
        if node.terminal {
            out.push(if suffix.is_empty() { ".".to_string() } else { suffix });
            return;
        }
        for (label, child) in &node.children {
            Self::collect(child, format!("{}.{}", label, suffix), out);
        }
    }

    /// Number of terminal suffixes.
    pub fn len(&self) -> usize {
        Self::count_terminals(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        !self.root.terminal && self.root.children.is_empty()
    }

    fn count_terminals(node: &TrieNode) -> usize {
        if node.terminal {
            return 1;
        }
        node.children.values().map(Self::count_terminals).sum()
    }
}

impl<S: AsRef<str>> FromIterator<S> for DomainTrie {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut trie = DomainTrie::new();
        for domain in iter {
            trie.insert(domain.as_ref());
        }
        trie
    }
}
