//! ABOUTME: Lexically nested variable scope used by the expression resolver and engine
//! ABOUTME: A stack of frames with root-rooted and branch-isolated writes

use super::value::Value;
use std::collections::HashMap;

/// A stack of frames defining the variables visible to templates and
/// expressions at a point in execution.
///
/// `lookup` walks top-down so the innermost frame wins. `bind` writes to the
/// top frame (ordinary lexical nesting: loop bodies, try/catch blocks).
/// `bind_at_root` writes to the frame marked as this scope's *origin* — the
/// root frame for the top-level run, or a branch's own private frame when
/// this `Scope` was produced by [`Scope::branch`]. That indirection is what
/// lets `parallel` isolate branch writes until they are explicitly merged
/// back under a branch-id prefix.
#[derive(Debug, Clone)]
pub struct Scope {
    frames: Vec<HashMap<String, Value>>,
    root_index: usize,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
            root_index: 0,
        }
    }

    #[must_use]
    pub fn with_root(root: HashMap<String, Value>) -> Self {
        Self {
            frames: vec![root],
            root_index: 0,
        }
    }

    /// Walks frames from innermost to outermost; the first defining frame
    /// wins. Undefined keys yield [`Value::Undefined`], never an error.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Value {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return value.clone();
            }
        }
        Value::Undefined
    }

    /// Writes to the innermost (current) frame.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.frames
            .last_mut()
            .expect("scope always has at least one frame")
            .insert(name.into(), value);
    }

    /// Writes to this scope's origin frame — used by `output_variable`.
    pub fn bind_at_root(&mut self, name: impl Into<String>, value: Value) {
        self.frames[self.root_index].insert(name.into(), value);
    }

    /// Pushes a fresh, empty frame (loop iteration, try/catch/finally block).
    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Pops and discards the top frame without merging it — used when a
    /// loop iteration ends, or when a failing `try` block's local mutations
    /// must not survive into `catch`/`finally`.
    pub fn pop_frame_discard(&mut self) {
        if self.frames.len() > self.root_index + 1 {
            self.frames.pop();
        }
    }

    /// Pops the top frame, optionally attaching its bindings under
    /// `prefix.` into the frame beneath it. Used by sequential constructs
    /// that want a child frame's bindings visible after it closes.
    pub fn merge(&mut self, prefix: Option<&str>) {
        if self.frames.len() <= self.root_index + 1 {
            return;
        }
        let popped = self.frames.pop().unwrap_or_default();
        let target = self
            .frames
            .last_mut()
            .expect("scope always has at least one frame");
        for (key, value) in popped {
            let merged_key = match prefix {
                Some(p) => format!("{p}.{key}"),
                None => key,
            };
            target.insert(merged_key, value);
        }
    }

    /// Produces an isolated scope for a `parallel` branch: everything
    /// currently visible can still be read, but `bind_at_root` in the
    /// returned scope targets a brand-new private frame, invisible to
    /// siblings and to the parent until [`Scope::take_branch_root`] is
    /// called and explicitly merged back.
    #[must_use]
    pub fn branch(&self) -> Self {
        let mut frames = self.frames.clone();
        frames.push(HashMap::new());
        let root_index = frames.len() - 1;
        Self { frames, root_index }
    }

    /// Consumes a branch scope, returning everything it wrote at its own
    /// root (every `output_variable` binding performed inside the branch).
    #[must_use]
    pub fn take_branch_root(mut self) -> HashMap<String, Value> {
        self.frames.remove(self.root_index)
    }

    /// Snapshot of the origin frame, used to build `WorkflowRun.output`.
    #[must_use]
    pub fn root_snapshot(&self) -> HashMap<String, Value> {
        self.frames[self.root_index].clone()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_innermost_first() {
        let mut scope = Scope::new();
        scope.bind_at_root("x", Value::Number(1.0));
        scope.push_frame();
        scope.bind("x", Value::Number(2.0));
        assert_eq!(scope.lookup("x"), Value::Number(2.0));
        scope.pop_frame_discard();
        assert_eq!(scope.lookup("x"), Value::Number(1.0));
    }

    #[test]
    fn undefined_for_missing_key() {
        let scope = Scope::new();
        assert!(scope.lookup("missing").is_undefined());
    }

    #[test]
    fn iteration_frame_does_not_leak() {
        let mut scope = Scope::new();
        scope.push_frame();
        scope.bind("item", Value::string("a"));
        scope.pop_frame_discard();
        scope.push_frame();
        assert!(scope.lookup("item").is_undefined());
        scope.pop_frame_discard();
    }

    #[test]
    fn branch_isolates_output_variable_writes() {
        let mut root = Scope::new();
        root.bind_at_root("shared", Value::string("base"));

        let mut branch_a = root.branch();
        branch_a.bind_at_root("local_var", Value::string("A"));
        let mut branch_b = root.branch();
        branch_b.bind_at_root("local_var", Value::string("B"));

        // Writes in a branch are invisible to the root and to siblings
        // until explicitly merged.
        assert!(root.lookup("local_var").is_undefined());

        let out_a = branch_a.take_branch_root();
        let out_b = branch_b.take_branch_root();

        for (key, value) in out_a {
            root.bind_at_root(format!("branch-a.{key}"), value);
        }
        for (key, value) in out_b {
            root.bind_at_root(format!("branch-b.{key}"), value);
        }

        assert_eq!(
            root.lookup("branch-a.local_var"),
            Value::string("A")
        );
        assert_eq!(
            root.lookup("branch-b.local_var"),
            Value::string("B")
        );
    }

    #[test]
    fn merge_applies_prefix() {
        let mut scope = Scope::new();
        scope.push_frame();
        scope.bind("a", Value::Number(1.0));
        scope.merge(Some("ns"));
        assert_eq!(scope.lookup("ns.a"), Value::Number(1.0));
    }

    use proptest::prelude::*;

    proptest! {
        /// Whatever a pushed frame binds, a plain discard must erase —
        /// `lookup` afterward always answers as if the frame never existed.
        #[test]
        fn pop_frame_discard_always_reverts_to_prior_value(
            name in "[a-z][a-z0-9_]{0,8}",
            outer in proptest::num::f64::NORMAL,
            inner in proptest::num::f64::NORMAL,
        ) {
            let mut scope = Scope::new();
            scope.bind_at_root(name.clone(), Value::Number(outer));
            let before = scope.lookup(&name);

            scope.push_frame();
            scope.bind(name.clone(), Value::Number(inner));
            scope.pop_frame_discard();

            prop_assert_eq!(scope.lookup(&name), before);
        }

        /// `merge(None)` must reproduce exactly the bindings a frame held,
        /// visible one level out, regardless of how many distinct keys it
        /// wrote.
        #[test]
        fn merge_without_prefix_surfaces_every_binding(
            keys in proptest::collection::vec("[a-z][a-z0-9_]{0,6}", 1..6),
            values in proptest::collection::vec(proptest::num::f64::NORMAL, 1..6),
        ) {
            let mut scope = Scope::new();
            scope.push_frame();
            let mut expected = std::collections::HashMap::new();
            for (key, value) in keys.into_iter().zip(values) {
                scope.bind(key.clone(), Value::Number(value));
                expected.insert(key, value);
            }
            scope.merge(None);

            for (key, value) in &expected {
                prop_assert_eq!(scope.lookup(key), Value::Number(*value));
            }
        }
    }
}
