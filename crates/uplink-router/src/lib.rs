//! uplink-router: Zero-dependency trie HTTP router
//!
//! The route table behind `uplink-core`. Handlers are referenced by a `u32`
//! id; the engine keeps the actual closures.
//!
//! ## Path Syntax
//! - `:name` - Named parameter (captures one segment)
//! - `*` or `*name` - Wildcard (captures the remaining path, final segment only)
//!
//! ## Priority
//! At every depth of the trie:
//! 1. Literal segment (highest)
//! 2. Parameter segment
//! 3. Wildcard (lowest)
//!
//! Routes that end on the same node are tried in registration order.
//! Routes registered for [`ANY_METHOD`] are consulted only after every
//! method-specific candidate.
//!
//! ## Yield
//! [`Router::candidates`] returns every matching route in priority order, so a
//! dispatcher can fall through to the next one when a handler declines.
//!
//! ## Example
//! ```
//! use uplink_router::Router;
//!
//! let mut router = Router::new();
//! router.insert("GET", "/users", 0).unwrap();
//! router.insert("GET", "/users/:id", 1).unwrap();
//! router.insert("GET", "/files/*path", 2).unwrap();
//!
//! let m = router.find("GET", "/users/123").unwrap();
//! assert_eq!(m.handler_id, 1);
//! assert_eq!(m.params, vec![("id".to_string(), "123".to_string())]);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Method key for routes that match every HTTP method.
pub const ANY_METHOD: &str = "*";

/// Route match result
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// The matched handler ID
    pub handler_id: u32,
    /// Captured path parameters as (name, value) pairs, in pattern order
    pub params: Vec<(String, String)>,
}

impl Match {
    /// Get params as HashMap for convenient access
    pub fn params_map(&self) -> HashMap<String, String> {
        self.params.iter().cloned().collect()
    }

    /// Positional parameter value
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|(_, v)| v.as_str())
    }
}

/// Registration failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The exact (method, pattern) pair is already registered
    Duplicate { method: String, pattern: String },
    /// A wildcard segment appears before the end of the pattern
    WildcardNotLast { pattern: String },
    /// `:` without a name
    EmptyParameterName { pattern: String },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Duplicate { method, pattern } => {
                write!(f, "route {} {} is already registered", method, pattern)
            }
            RouteError::WildcardNotLast { pattern } => {
                write!(f, "wildcard must be the last segment in {}", pattern)
            }
            RouteError::EmptyParameterName { pattern } => {
                write!(f, "parameter without a name in {}", pattern)
            }
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone)]
struct Route {
    handler_id: u32,
    /// Parameter names of this route's own pattern
    names: Vec<String>,
}

/// Trie node for path segment matching
#[derive(Debug, Default)]
struct Node {
    /// Static children (key = path segment)
    children: HashMap<String, Node>,
    /// Parameter child (:id). Shared by every pattern with a parameter here.
    param_child: Option<Box<Node>>,
    /// Routes whose wildcard starts at this node
    wildcard: Vec<Route>,
    /// Routes terminating at this node
    routes: Vec<Route>,
}

/// Zero-dependency trie HTTP router
///
/// Routes are organized by HTTP method for O(1) method dispatch,
/// then matched segment by segment.
#[derive(Debug, Default)]
pub struct Router {
    /// Method -> Trie root
    trees: HashMap<String, Node>,
    /// Routes registered for every method
    any: Node,
    /// Registered (method, normalized pattern) pairs
    patterns: HashSet<(String, String)>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn method_key(method: &str) -> String {
    let upper = method.to_uppercase();
    if upper == "ANY" {
        ANY_METHOD.to_string()
    } else {
        upper
    }
}

impl Router {
    /// Create a new router
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.), or `*` / `any` for all methods
    /// * `pattern` - URL pattern with optional params (:id) and a trailing wildcard (*)
    /// * `handler_id` - Identifier handed back on match
    ///
    /// # Errors
    /// Registering the same method and pattern twice, a wildcard that is not
    /// the last segment, or an unnamed parameter.
    pub fn insert(&mut self, method: &str, pattern: &str, handler_id: u32) -> Result<(), RouteError> {
        let method = method_key(method);
        let segs = segments(pattern);

        let mut names = Vec::new();
        for (i, segment) in segs.iter().enumerate() {
            if let Some(name) = segment.strip_prefix('*') {
                if i + 1 != segs.len() {
                    return Err(RouteError::WildcardNotLast { pattern: pattern.to_string() });
                }
                names.push(if name.is_empty() { "*".to_string() } else { name.to_string() });
            } else if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteError::EmptyParameterName { pattern: pattern.to_string() });
                }
                names.push(name.to_string());
            }
        }

        if !self.patterns.insert((method.clone(), segs.join("/"))) {
            return Err(RouteError::Duplicate { method, pattern: pattern.to_string() });
        }

        let tree = if method == ANY_METHOD {
            &mut self.any
        } else {
            self.trees.entry(method).or_default()
        };
        let route = Route { handler_id, names };

        let mut node = tree;
        for segment in segs {
            if segment.starts_with('*') {
                node.wildcard.push(route);
                return Ok(());
            } else if segment.starts_with(':') {
                node = node.param_child.get_or_insert_with(Default::default);
            } else {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        node.routes.push(route);
        Ok(())
    }

    /// Find the highest-priority matching route
    ///
    /// # Example
    /// ```
    /// use uplink_router::Router;
    ///
    /// let mut router = Router::new();
    /// router.insert("GET", "/users/:id", 0).unwrap();
    ///
    /// let m = router.find("GET", "/users/42").unwrap();
    /// assert_eq!(m.handler_id, 0);
    /// assert_eq!(m.params[0], ("id".to_string(), "42".to_string()));
    /// ```
    pub fn find(&self, method: &str, path: &str) -> Option<Match> {
        let mut out = Vec::with_capacity(1);
        self.search(method, path, &mut out, true);
        out.pop()
    }

    /// Every matching route, most specific first, `any` routes last
    pub fn candidates(&self, method: &str, path: &str) -> Vec<Match> {
        let mut out = Vec::new();
        self.search(method, path, &mut out, false);
        out
    }

    fn search(&self, method: &str, path: &str, out: &mut Vec<Match>, first_only: bool) {
        let method = method_key(method);
        let segs = segments(path);
        let mut captured = Vec::new();

        if method != ANY_METHOD {
            if let Some(tree) = self.trees.get(&method) {
                if Self::collect(tree, &segs, &mut captured, out, first_only) {
                    return;
                }
            }
        }
        Self::collect(&self.any, &segs, &mut captured, out, first_only);
    }

    /// Depth-first walk; returns true once a single match was requested and found
    fn collect(
        node: &Node,
        segs: &[&str],
        captured: &mut Vec<String>,
        out: &mut Vec<Match>,
        first_only: bool,
    ) -> bool {
        if let Some((segment, rest)) = segs.split_first() {
            // Priority 1: literal segment
            if let Some(child) = node.children.get(*segment) {
                if Self::collect(child, rest, captured, out, first_only) {
                    return true;
                }
            }

            // Priority 2: parameter
            if let Some(ref param) = node.param_child {
                captured.push(segment.to_string());
                let done = Self::collect(param, rest, captured, out, first_only);
                captured.pop();
                if done {
                    return true;
                }
            }
        } else {
            for route in &node.routes {
                out.push(Self::make_match(route, captured));
                if first_only {
                    return true;
                }
            }
        }

        // Priority 3: wildcard, captures the remaining (possibly empty) tail
        if !node.wildcard.is_empty() {
            captured.push(segs.join("/"));
            for route in &node.wildcard {
                out.push(Self::make_match(route, captured));
                if first_only {
                    captured.pop();
                    return true;
                }
            }
            captured.pop();
        }

        false
    }

    fn make_match(route: &Route, captured: &[String]) -> Match {
        Match {
            handler_id: route.handler_id,
            params: route.names.iter().cloned().zip(captured.iter().cloned()).collect(),
        }
    }

    /// Check if a method has any routes registered
    pub fn has_method(&self, method: &str) -> bool {
        let method = method_key(method);
        if method == ANY_METHOD {
            return self.patterns.iter().any(|(m, _)| m == ANY_METHOD);
        }
        self.trees.contains_key(&method)
    }

    /// Get all registered methods
    pub fn methods(&self) -> Vec<String> {
        self.trees.keys().cloned().collect()
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
