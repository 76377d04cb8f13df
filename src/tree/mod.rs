//! Compressed radix tree for path routing.
//!
//! Paths share storage along common prefixes, so `/user/list` and
//! `/user/:id` split a single `/user/` node. Three node kinds exist:
//! static text, `:param` (captures one slash-delimited token), and
//! `*wildcard` (captures the rest of the path, slashes included, and must
//! terminate its pattern).
//!
//! Registration conflicts are configuration bugs, so insertion panics
//! rather than returning an error. Lookup never panics; a miss reports
//! whether the path would have matched with the trailing slash toggled, so
//! the dispatcher can answer with a redirect.

use crate::context::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Static,
    /// `:name` segment. The node path keeps the leading `:`.
    Param,
    /// `*name` segment. The node path keeps the leading `*`.
    CatchAll,
}

#[derive(Debug)]
struct Node {
    path: String,
    /// First byte of each static child's path, index-aligned with `children`.
    indices: Vec<u8>,
    children: Vec<Node>,
    /// At most one param or catch-all child per node.
    wild: Option<Box<Node>>,
    kind: NodeKind,
    /// Full registered pattern, set when a route terminates here.
    route: Option<String>,
}

impl Node {
    fn new(path: &str, kind: NodeKind) -> Self {
        Self {
            path: path.to_string(),
            indices: Vec::new(),
            children: Vec::new(),
            wild: None,
            kind,
            route: None,
        }
    }

    fn insert(&mut self, rest: &str, full: &str) {
        if rest.is_empty() {
            if self.route.is_some() {
                panic!("route '{full}' is already registered");
            }
            self.route = Some(full.to_string());
            return;
        }
        if self.kind == NodeKind::CatchAll {
            panic!("catch-all must be the final segment in '{full}'");
        }

        match rest.as_bytes()[0] {
            b':' => self.insert_param(rest, full),
            b'*' => self.insert_catch_all(rest, full),
            _ => self.insert_static(rest, full),
        }
    }

    fn insert_param(&mut self, rest: &str, full: &str) {
        let end = rest.find('/').unwrap_or(rest.len());
        let name = &rest[..end];
        if name.len() < 2 {
            panic!("parameter in '{full}' must have a name");
        }
        if !self.children.is_empty() {
            panic!(
                "parameter '{name}' in '{full}' conflicts with existing static segments"
            );
        }
        match &self.wild {
            Some(w) if w.kind == NodeKind::Param && w.path == name => {}
            Some(w) => panic!(
                "parameter '{name}' in '{full}' conflicts with existing wildcard '{}'",
                w.path
            ),
            None => self.wild = Some(Box::new(Node::new(name, NodeKind::Param))),
        }
        self.wild
            .as_mut()
            .unwrap_or_else(|| unreachable!())
            .insert(&rest[end..], full);
    }

    fn insert_catch_all(&mut self, rest: &str, full: &str) {
        if rest.len() < 2 {
            panic!("catch-all in '{full}' must have a name");
        }
        if rest[1..].contains('/') {
            panic!("catch-all must be the final segment in '{full}'");
        }
        if !self.path.ends_with('/') {
            panic!("catch-all in '{full}' must follow a '/'");
        }
        if !self.children.is_empty() {
            panic!(
                "catch-all '{rest}' in '{full}' conflicts with existing static segments"
            );
        }
        match &self.wild {
            Some(w) if w.kind == NodeKind::CatchAll && w.path == rest => {}
            Some(w) => panic!(
                "catch-all '{rest}' in '{full}' conflicts with existing wildcard '{}'",
                w.path
            ),
            None => self.wild = Some(Box::new(Node::new(rest, NodeKind::CatchAll))),
        }
        self.wild
            .as_mut()
            .unwrap_or_else(|| unreachable!())
            .insert("", full);
    }

    fn insert_static(&mut self, rest: &str, full: &str) {
        let end = rest
            .bytes()
            .position(|b| b == b':' || b == b'*')
            .unwrap_or(rest.len());
        let prefix = &rest[..end];
        if let Some(w) = &self.wild {
            panic!(
                "static segment '{prefix}' in '{full}' conflicts with existing wildcard '{}'",
                w.path
            );
        }

        let first = prefix.as_bytes()[0];
        if let Some(i) = self.indices.iter().position(|&b| b == first) {
            let child = &mut self.children[i];
            let lcp = common_prefix_len(prefix, &child.path);
            if lcp < child.path.len() {
                child.split_at(lcp);
            }
            child.insert(&rest[lcp..], full);
        } else {
            self.indices.push(first);
            self.children.push(Node::new(prefix, NodeKind::Static));
            let last = self.children.len() - 1;
            self.children[last].insert(&rest[end..], full);
        }
    }

    /// Splits this static node at byte offset `at`, pushing everything past
    /// the offset down into a new single child.
    fn split_at(&mut self, at: usize) {
        let tail = Node {
            path: self.path[at..].to_string(),
            indices: std::mem::take(&mut self.indices),
            children: std::mem::take(&mut self.children),
            wild: self.wild.take(),
            kind: NodeKind::Static,
            route: self.route.take(),
        };
        self.path.truncate(at);
        self.indices = vec![tail.path.as_bytes()[0]];
        self.children = vec![tail];
    }

    fn static_child(&self, first: u8) -> Option<&Node> {
        self.indices
            .iter()
            .position(|&b| b == first)
            .map(|i| &self.children[i])
    }

    /// `true` when a route terminates at this node's `/` child, or at a
    /// catch-all directly below it. Used for trailing-slash hints.
    fn slash_child_has_route(&self) -> bool {
        self.static_child(b'/').is_some_and(|c| {
            c.path == "/"
                && (c.route.is_some()
                    || c.wild
                        .as_deref()
                        .is_some_and(|w| w.kind == NodeKind::CatchAll && w.route.is_some()))
        })
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// Radix tree mapping request paths to registered route patterns.
///
/// Lookups return the pattern string; callers resolve it to a route record
/// themselves. Captured parameters are appended to the caller's [`Params`]
/// buffer as matching proceeds, so on a miss the caller should discard the
/// buffer's contents.
#[derive(Debug)]
pub(crate) struct PathTree {
    root: Node,
}

impl PathTree {
    pub(crate) fn new() -> Self {
        Self {
            root: Node::new("", NodeKind::Static),
        }
    }

    /// Inserts a route pattern. Panics on malformed or conflicting patterns.
    pub(crate) fn add_route(&mut self, path: &str) {
        if !path.starts_with('/') {
            panic!("path '{path}' must begin with '/'");
        }
        self.root.insert(path, path);
    }

    /// Resolves `path` to a registered pattern, appending captured
    /// parameters to `params`.
    ///
    /// The second value is the trailing-slash hint: `true` means no route
    /// matched as-is, but toggling the trailing slash would match.
    pub(crate) fn get_value<'t>(
        &'t self,
        path: &str,
        params: &mut Params,
    ) -> (Option<&'t str>, bool) {
        let mut current = &self.root;
        let mut rest = path;

        loop {
            let prefix = current.path.as_str();

            if rest.len() > prefix.len() && rest.starts_with(prefix) {
                rest = &rest[prefix.len()..];

                if let Some(child) = current.static_child(rest.as_bytes()[0]) {
                    current = child;
                    continue;
                }

                match current.wild.as_deref() {
                    Some(w) if w.kind == NodeKind::Param => {
                        let end = rest.find('/').unwrap_or(rest.len());
                        if end == 0 {
                            // Empty parameter values never match.
                            return (None, false);
                        }
                        params.push(&w.path[1..], &rest[..end]);

                        if end < rest.len() {
                            match w.static_child(rest.as_bytes()[end]) {
                                Some(child) => {
                                    rest = &rest[end..];
                                    current = child;
                                    continue;
                                }
                                None => {
                                    let tsr = rest.len() == end + 1 && w.route.is_some();
                                    return (None, tsr);
                                }
                            }
                        }
                        if let Some(route) = w.route.as_deref() {
                            return (Some(route), false);
                        }
                        return (None, w.slash_child_has_route());
                    }
                    Some(w) => {
                        // Catch-all: everything left, slashes included.
                        params.push(&w.path[1..], rest);
                        return (w.route.as_deref(), false);
                    }
                    None => {
                        let tsr = rest == "/" && current.route.is_some();
                        return (None, tsr);
                    }
                }
            }

            if rest == prefix {
                if let Some(route) = current.route.as_deref() {
                    return (Some(route), false);
                }
                // A catch-all below a trailing `/` also matches the empty
                // remainder, capturing "".
                if let Some(w) = current.wild.as_deref() {
                    if w.kind == NodeKind::CatchAll {
                        params.push(&w.path[1..], "");
                        return (w.route.as_deref(), false);
                    }
                }
                return (None, current.slash_child_has_route());
            }

            // Path ran out inside this node's text: hint a redirect when the
            // only difference is this node's trailing slash.
            let tsr = prefix.len() == rest.len() + 1
                && prefix.ends_with('/')
                && prefix[..rest.len()] == *rest
                && (current.route.is_some()
                    || current
                        .wild
                        .as_deref()
                        .is_some_and(|w| w.kind == NodeKind::CatchAll && w.route.is_some()));
            return (None, tsr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(paths: &[&str]) -> PathTree {
        let mut t = PathTree::new();
        for p in paths {
            t.add_route(p);
        }
        t
    }

    fn lookup(t: &PathTree, path: &str) -> (Option<String>, Vec<(String, String)>, bool) {
        let mut params = Params::new();
        let (route, tsr) = t.get_value(path, &mut params);
        let pairs = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        (route.map(str::to_string), pairs, tsr)
    }

    #[test]
    fn static_routes() {
        let t = tree(&["/", "/ping", "/user/list", "/user/login"]);
        for path in ["/", "/ping", "/user/list", "/user/login"] {
            let (route, params, _) = lookup(&t, path);
            assert_eq!(route.as_deref(), Some(path));
            assert!(params.is_empty());
        }
        let (route, _, tsr) = lookup(&t, "/pong");
        assert_eq!(route, None);
        assert!(!tsr);
    }

    #[test]
    fn prefix_split_preserves_routes() {
        // "/user" arrives after "/user/list" forced a shared prefix node.
        let t = tree(&["/user/list", "/user"]);
        assert_eq!(lookup(&t, "/user").0.as_deref(), Some("/user"));
        assert_eq!(lookup(&t, "/user/list").0.as_deref(), Some("/user/list"));
    }

    #[test]
    fn param_capture() {
        let t = tree(&["/user/:id", "/user/:id/posts"]);
        let (route, params, _) = lookup(&t, "/user/42");
        assert_eq!(route.as_deref(), Some("/user/:id"));
        assert_eq!(params, vec![("id".to_string(), "42".to_string())]);

        let (route, params, _) = lookup(&t, "/user/7/posts");
        assert_eq!(route.as_deref(), Some("/user/:id/posts"));
        assert_eq!(params, vec![("id".to_string(), "7".to_string())]);
    }

    #[test]
    fn empty_param_never_matches() {
        let t = tree(&["/user/:id"]);
        let (route, _, tsr) = lookup(&t, "/user/");
        assert_eq!(route, None);
        assert!(!tsr);
    }

    #[test]
    fn catch_all_takes_remainder() {
        let t = tree(&["/static/*rest"]);
        let (route, params, _) = lookup(&t, "/static/a/b/c");
        assert_eq!(route.as_deref(), Some("/static/*rest"));
        assert_eq!(params, vec![("rest".to_string(), "a/b/c".to_string())]);

        // Matching stops exactly at the registered prefix.
        let (route, params, _) = lookup(&t, "/static/");
        assert_eq!(route.as_deref(), Some("/static/*rest"));
        assert_eq!(params, vec![("rest".to_string(), String::new())]);
    }

    #[test]
    fn trailing_slash_hints() {
        let t = tree(&["/a/b", "/c/"]);
        let (route, _, tsr) = lookup(&t, "/a/b/");
        assert_eq!(route, None);
        assert!(tsr);

        let (route, _, tsr) = lookup(&t, "/c");
        assert_eq!(route, None);
        assert!(tsr);
    }

    #[test]
    fn param_trailing_slash_hint() {
        let t = tree(&["/user/:id"]);
        let (route, _, tsr) = lookup(&t, "/user/42/");
        assert_eq!(route, None);
        assert!(tsr);
    }

    #[test]
    #[should_panic(expected = "begin with")]
    fn relative_path_rejected() {
        tree(&["ping"]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_route_rejected() {
        tree(&["/ping", "/ping"]);
    }

    #[test]
    #[should_panic(expected = "conflicts")]
    fn conflicting_param_names_rejected() {
        tree(&["/user/:id", "/user/:name"]);
    }

    #[test]
    #[should_panic(expected = "conflicts")]
    fn static_after_param_rejected() {
        tree(&["/user/:id", "/user/me"]);
    }

    #[test]
    #[should_panic(expected = "final segment")]
    fn catch_all_must_be_terminal() {
        tree(&["/files/*path/extra"]);
    }
}
