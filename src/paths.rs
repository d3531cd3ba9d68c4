//! Incremental path construction
//!
//! Entries never store their full path. Each one holds an [`PathNode`]: a
//! refcounted link to its parent chain plus its own base name, so ancestor
//! prefixes are shared across every entry under them. [`PathScratch`] renders
//! a node's full path into a single reusable buffer, truncating back to the
//! longest prefix shared with the previously rendered path instead of
//! rebuilding from the root.
//!
//! Consecutive visits almost always share a deep prefix (siblings share all
//! of it), so a render is usually one truncate plus one name append.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One component in a shared path chain
#[derive(Debug)]
pub struct PathNode {
    parent: Option<Arc<PathNode>>,
    name: OsString,
    depth: u32,
}

impl PathNode {
    /// A chain head holding a root path as given on the command line
    pub fn root(name: impl Into<OsString>) -> Arc<PathNode> {
        Arc::new(PathNode {
            parent: None,
            name: name.into(),
            depth: 0,
        })
    }

    /// Extend the chain with a child name
    pub fn child(self: &Arc<Self>, name: impl Into<OsString>) -> Arc<PathNode> {
        Arc::new(PathNode {
            parent: Some(Arc::clone(self)),
            name: name.into(),
            depth: self.depth + 1,
        })
    }

    /// Base name of this component
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Depth below the root (roots are 0)
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Parent link, `None` for roots
    pub fn parent(&self) -> Option<&Arc<PathNode>> {
        self.parent.as_ref()
    }

    /// Materialize the full path with a fresh allocation
    ///
    /// Prefer [`PathScratch::render`] on hot paths.
    pub fn to_path_buf(self: &Arc<Self>) -> PathBuf {
        let mut scratch = PathScratch::new();
        scratch.render(self).to_path_buf()
    }
}

/// Reusable render buffer for [`PathNode`] chains
pub struct PathScratch {
    buf: Vec<u8>,
    // Rendered chain, outermost first, with the buffer length after each
    // component.
    stack: Vec<(Arc<PathNode>, usize)>,
    chain: Vec<Arc<PathNode>>,
}

impl PathScratch {
    pub fn new() -> PathScratch {
        PathScratch {
            buf: Vec::with_capacity(256),
            stack: Vec::new(),
            chain: Vec::new(),
        }
    }

    /// Render the full path for `node`, reusing the prefix shared with the
    /// previously rendered node
    pub fn render(&mut self, node: &Arc<PathNode>) -> &Path {
        self.chain.clear();
        let mut cur = Some(Arc::clone(node));
        while let Some(n) = cur {
            cur = n.parent().cloned();
            self.chain.push(n);
        }
        self.chain.reverse();

        let mut common = 0;
        while common < self.stack.len()
            && common < self.chain.len()
            && Arc::ptr_eq(&self.stack[common].0, &self.chain[common])
        {
            common += 1;
        }

        let keep = if common == 0 {
            0
        } else {
            self.stack[common - 1].1
        };
        self.buf.truncate(keep);
        self.stack.truncate(common);

        for n in &self.chain[common..] {
            if !self.buf.is_empty() && !self.buf.ends_with(b"/") {
                self.buf.push(b'/');
            }
            self.buf.extend_from_slice(n.name().as_bytes());
            self.stack.push((Arc::clone(n), self.buf.len()));
        }

        Path::new(OsStr::from_bytes(&self.buf))
    }

    /// Render into an owned `PathBuf`
    pub fn render_owned(&mut self, node: &Arc<PathNode>) -> PathBuf {
        PathBuf::from(OsString::from_vec(self.render(node).as_os_str().as_bytes().to_vec()))
    }
}

impl Default for PathScratch {
    fn default() -> Self {
        PathScratch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_single_root() {
        let root = PathNode::root("/tmp");
        let mut scratch = PathScratch::new();
        assert_eq!(scratch.render(&root), Path::new("/tmp"));
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn test_render_chain() {
        let root = PathNode::root("/r");
        let a = root.child("a");
        let x = a.child("x");
        let mut scratch = PathScratch::new();
        assert_eq!(scratch.render(&x), Path::new("/r/a/x"));
        assert_eq!(x.depth(), 2);
    }

    #[test]
    fn test_prefix_reuse_across_siblings() {
        let root = PathNode::root("base");
        let a = root.child("a");
        let x = a.child("x");
        let y = a.child("y");
        let b = root.child("b");

        let mut scratch = PathScratch::new();
        assert_eq!(scratch.render(&x), Path::new("base/a/x"));
        assert_eq!(scratch.render(&y), Path::new("base/a/y"));
        assert_eq!(scratch.render(&b), Path::new("base/b"));
        assert_eq!(scratch.render(&root), Path::new("base"));
        assert_eq!(scratch.render(&x), Path::new("base/a/x"));
    }

    #[test]
    fn test_absolute_root_keeps_single_slash() {
        let root = PathNode::root("/");
        let etc = root.child("etc");
        let mut scratch = PathScratch::new();
        assert_eq!(scratch.render(&etc), Path::new("/etc"));
    }

    #[test]
    fn test_switch_between_unrelated_roots() {
        let r1 = PathNode::root("one");
        let r2 = PathNode::root("two");
        let c1 = r1.child("x");
        let c2 = r2.child("x");
        let mut scratch = PathScratch::new();
        assert_eq!(scratch.render(&c1), Path::new("one/x"));
        assert_eq!(scratch.render(&c2), Path::new("two/x"));
    }

    #[test]
    fn test_to_path_buf_matches_render() {
        let root = PathNode::root("/r");
        let deep = root.child("a").child("b").child("c");
        assert_eq!(deep.to_path_buf(), PathBuf::from("/r/a/b/c"));
    }
}
