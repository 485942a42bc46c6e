use std::fmt;
use std::sync::Arc;

use crate::value::Ident;
use crate::var::Var;

/// A single environment binding.
#[derive(Clone, Debug)]
pub struct EnvEntry {
    pub ident: Ident,
    pub var: Var,
}

impl EnvEntry {
    pub fn new(ident: Ident, var: Var) -> EnvEntry {
        EnvEntry { ident, var }
    }
}

/// An immutable chain of scopes. Lookup walks leaf to root; entries within a
/// node shadow the parent chain, and later entries shadow earlier ones.
#[derive(Clone, Default)]
pub struct Env(Option<Arc<EnvNode>>);

struct EnvNode {
    entries: Vec<EnvEntry>,
    parent: Env,
}

impl Env {
    pub fn empty() -> Env {
        Env(None)
    }

    pub fn create(parent: Env, entries: Vec<EnvEntry>) -> Env {
        Env(Some(Arc::new(EnvNode { entries, parent })))
    }

    /// A new leaf scope with a single binding.
    pub fn add(&self, entry: EnvEntry) -> Env {
        Env::create(self.clone(), vec![entry])
    }

    pub fn get(&self, ident: &Ident) -> Option<Var> {
        let mut current = self;
        while let Some(node) = &current.0 {
            for entry in node.entries.iter().rev() {
                if entry.ident == *ident {
                    return Some(entry.var.clone());
                }
            }
            current = &node.parent;
        }
        None
    }

    pub fn contains(&self, ident: &Ident) -> bool {
        self.get(ident).is_some()
    }

    /// The entries of the leaf scope only. Captured closure environments are
    /// flat, so this is the full capture list for them.
    pub fn local_entries(&self) -> &[EnvEntry] {
        match &self.0 {
            Some(node) => &node.entries,
            None => &[],
        }
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        let mut current = self;
        while let Some(node) = &current.0 {
            for entry in &node.entries {
                set.entry(&entry.ident);
            }
            current = &node.parent;
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Literal;
    use crate::var::{ValueOrVar, Var};

    #[test]
    fn lookup_walks_leaf_to_root() {
        let root = Env::create(
            Env::empty(),
            vec![EnvEntry::new(
                Ident::new("x"),
                Var::bound(Literal::Int64(1).into()),
            )],
        );
        let leaf = Env::create(
            root.clone(),
            vec![EnvEntry::new(
                Ident::new("y"),
                Var::bound(Literal::Int64(2).into()),
            )],
        );
        assert!(leaf.get(&Ident::new("x")).is_some());
        assert!(leaf.get(&Ident::new("y")).is_some());
        assert!(root.get(&Ident::new("y")).is_none());
        assert!(leaf.get(&Ident::new("z")).is_none());
    }

    #[test]
    fn leaf_bindings_shadow_parent() {
        let root = Env::create(
            Env::empty(),
            vec![EnvEntry::new(
                Ident::new("x"),
                Var::bound(Literal::Int64(1).into()),
            )],
        );
        let leaf = root.add(EnvEntry::new(
            Ident::new("x"),
            Var::bound(Literal::Int64(2).into()),
        ));
        let var = leaf.get(&Ident::new("x")).unwrap();
        match var.resolve_value_or_var() {
            ValueOrVar::Value(value) => {
                assert!(matches!(
                    value,
                    crate::value::Value::Literal(Literal::Int64(2))
                ));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}
