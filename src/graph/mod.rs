//! Pipeline graphs: declarative definitions compiled into immutable graphs.
//!
//! A [`GraphDefinition`] names its steps, one entry node, and the routing out
//! of every node. [`GraphDefinition::compile`] checks all of that up front so
//! that a [`CompiledGraph`] can resolve a successor for any state without
//! ever failing at run time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::schema::InputSchema;
use crate::state::State;
use crate::step::Step;

pub mod edge;

pub use edge::{EdgeCondition, Predicate, Routing, Target};

/// A declarative pipeline definition.
///
/// # Example
///
/// ```rust
/// use campus_agents::graph::{EdgeCondition, GraphDefinition, Target};
/// use campus_agents::{LambdaStep, StateDelta};
///
/// let graph = GraphDefinition::new("demo")
///     .add_node("check", LambdaStep::new(|_| async { Ok(StateDelta::new().set("ok", true)) }))
///     .add_node("act", LambdaStep::new(|_| async { Ok(StateDelta::new()) }))
///     .set_entry("check")
///     .add_conditional_edges("check", vec![(EdgeCondition::truthy("ok"), Target::node("act"))], Target::End)
///     .set_finish("act")
///     .compile()
///     .unwrap();
///
/// assert_eq!(graph.entry(), "check");
/// ```
pub struct GraphDefinition {
    name: String,
    nodes: Vec<(String, Arc<dyn Step>)>,
    entries: Vec<String>,
    routes: Vec<(String, Routing)>,
    schema: Option<InputSchema>,
}

impl GraphDefinition {
    /// Start an empty definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            entries: Vec::new(),
            routes: Vec::new(),
            schema: None,
        }
    }

    /// Register a step under `name`.
    pub fn add_node<S: Step + 'static>(self, name: impl Into<String>, step: S) -> Self {
        self.add_shared_node(name, Arc::new(step))
    }

    /// Register an already shared step under `name`.
    pub fn add_shared_node(mut self, name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.nodes.push((name.into(), step));
        self
    }

    /// Designate the entry node.
    pub fn set_entry(mut self, name: impl Into<String>) -> Self {
        self.entries.push(name.into());
        self
    }

    /// Unconditional edge from `from` to `to`.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<Target>) -> Self {
        self.routes.push((from.into(), Routing::Always(to.into())));
        self
    }

    /// Conditional edges out of `from`, evaluated in order, with a mandatory default.
    pub fn add_conditional_edges(
        mut self,
        from: impl Into<String>,
        branches: Vec<(EdgeCondition, Target)>,
        default: impl Into<Target>,
    ) -> Self {
        self.routes.push((
            from.into(),
            Routing::Conditional {
                branches,
                default: default.into(),
            },
        ));
        self
    }

    /// Make `name` a finish node (edge to the terminal sentinel).
    pub fn set_finish(self, name: impl Into<String>) -> Self {
        self.add_edge(name, Target::End)
    }

    /// Attach an input schema checked at the start of every run.
    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Validate the definition and freeze it.
    pub fn compile(self) -> Result<CompiledGraph> {
        let GraphDefinition {
            name,
            nodes,
            entries,
            routes,
            schema,
        } = self;
        let fail = |msg: String| Error::Definition(format!("graph '{name}': {msg}"));

        if nodes.is_empty() {
            return Err(fail("no nodes defined".into()));
        }

        let mut order = Vec::with_capacity(nodes.len());
        let mut steps: HashMap<String, Arc<dyn Step>> = HashMap::with_capacity(nodes.len());
        for (node, step) in nodes {
            if node.is_empty() {
                return Err(fail("node names must not be empty".into()));
            }
            if steps.insert(node.clone(), step).is_some() {
                return Err(fail(format!("duplicate node name '{node}'")));
            }
            order.push(node);
        }

        let entry = match entries.as_slice() {
            [] => return Err(fail("no entry node".into())),
            [entry] => entry.clone(),
            many => return Err(fail(format!("multiple entry nodes: {}", many.join(", ")))),
        };
        if !steps.contains_key(&entry) {
            return Err(fail(format!("entry node '{entry}' does not exist")));
        }

        let mut routing: HashMap<String, Routing> = HashMap::with_capacity(routes.len());
        for (from, route) in routes {
            if !steps.contains_key(&from) {
                return Err(fail(format!("edge from unknown node '{from}'")));
            }
            for target in route.targets() {
                if let Target::Node(to) = target {
                    if !steps.contains_key(to) {
                        return Err(fail(format!("edge from '{from}' to unknown node '{to}'")));
                    }
                }
            }
            if routing.insert(from.clone(), route).is_some() {
                return Err(fail(format!("node '{from}' has more than one routing")));
            }
        }

        if let Some(node) = order.iter().find(|n| !routing.contains_key(*n)) {
            return Err(fail(format!("node '{node}' has no outgoing edge")));
        }

        let graph = CompiledGraph {
            name,
            entry,
            order,
            steps,
            routing,
            schema,
        };
        graph.check_acyclic()?;

        let reachable = graph.reachable();
        for node in graph.order.iter().filter(|n| !reachable.contains(n.as_str())) {
            warn!(graph = %graph.name, node = %node, "Node is unreachable from entry");
        }
        debug!(graph = %graph.name, nodes = graph.order.len(), "Compiled pipeline graph");

        Ok(graph)
    }
}

/// An immutable, validated pipeline graph. Share it behind an `Arc`.
pub struct CompiledGraph {
    name: String,
    entry: String,
    order: Vec<String>,
    steps: HashMap<String, Arc<dyn Step>>,
    routing: HashMap<String, Routing>,
    schema: Option<InputSchema>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .finish()
    }
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The single entry node.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Node names in declaration order.
    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn schema(&self) -> Option<&InputSchema> {
        self.schema.as_ref()
    }

    pub(crate) fn step(&self, node: &str) -> Option<&Arc<dyn Step>> {
        self.steps.get(node)
    }

    /// The statically known set of possible successors of `node`.
    pub fn successors(&self, node: &str) -> Vec<Target> {
        let mut seen = Vec::new();
        if let Some(route) = self.routing.get(node) {
            for target in route.targets() {
                if !seen.contains(target) {
                    seen.push(target.clone());
                }
            }
        }
        seen
    }

    /// Resolve the successor of `current` for `state`.
    ///
    /// Only fails when `current` is not a node of this graph.
    pub fn next_node(&self, current: &str, state: &State) -> Result<Target> {
        self.routing
            .get(current)
            .map(|route| route.resolve(state).clone())
            .ok_or_else(|| {
                Error::Internal(format!("graph '{}' has no node '{current}'", self.name))
            })
    }

    /// Nodes reachable from the entry.
    pub fn reachable(&self) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry.as_str()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(route) = self.routing.get(node) {
                stack.extend(route.targets().into_iter().filter_map(Target::as_node));
            }
        }
        seen
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a CompiledGraph,
            node: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Result<()> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    path.push(node);
                    return Err(Error::Definition(format!(
                        "graph '{}': cycle detected: {}",
                        graph.name,
                        path.join(" -> ")
                    )));
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node);
            if let Some(route) = graph.routing.get(node) {
                for next in route.targets().into_iter().filter_map(Target::as_node) {
                    visit(graph, next, marks, path)?;
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        for node in &self.order {
            visit(self, node, &mut marks, &mut path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDelta;
    use crate::step::PassStep;

    fn linear() -> GraphDefinition {
        GraphDefinition::new("linear")
            .add_node("a", PassStep)
            .add_node("b", PassStep)
            .set_entry("a")
            .add_edge("a", "b")
            .set_finish("b")
    }

    fn definition_error(def: GraphDefinition) -> String {
        match def.compile() {
            Err(Error::Definition(msg)) => msg,
            other => panic!("expected definition error, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_linear_graph() {
        let graph = linear().compile().unwrap();
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.node_names(), ["a", "b"]);
        assert_eq!(graph.next_node("a", &State::new()).unwrap(), Target::node("b"));
        assert_eq!(graph.next_node("b", &State::new()).unwrap(), Target::End);
        assert!(graph.next_node("zzz", &State::new()).is_err());
    }

    #[test]
    fn test_rejects_missing_or_multiple_entries() {
        let def = GraphDefinition::new("g").add_node("a", PassStep).set_finish("a");
        assert!(definition_error(def).contains("no entry"));

        let def = linear().set_entry("b");
        assert!(definition_error(def).contains("multiple entry"));

        let def = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .set_entry("x")
            .set_finish("a");
        assert!(definition_error(def).contains("does not exist"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let def = linear().add_node("a", PassStep);
        assert!(definition_error(def).contains("duplicate node name 'a'"));
    }

    #[test]
    fn test_rejects_unknown_successor() {
        let def = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .set_entry("a")
            .add_conditional_edges(
                "a",
                vec![(EdgeCondition::truthy("x"), Target::node("ghost"))],
                Target::End,
            );
        assert!(definition_error(def).contains("unknown node 'ghost'"));
    }

    #[test]
    fn test_rejects_node_without_routing() {
        let def = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .add_node("b", PassStep)
            .set_entry("a")
            .add_edge("a", "b");
        assert!(definition_error(def).contains("'b' has no outgoing edge"));
    }

    #[test]
    fn test_rejects_double_routing() {
        let def = linear().add_edge("a", Target::End);
        assert!(definition_error(def).contains("more than one routing"));
    }

    #[test]
    fn test_rejects_cycles() {
        let def = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .add_node("b", PassStep)
            .set_entry("a")
            .add_edge("a", "b")
            .add_conditional_edges(
                "b",
                vec![(EdgeCondition::truthy("again"), Target::node("a"))],
                Target::End,
            );
        assert!(definition_error(def).contains("cycle detected"));

        let def = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .set_entry("a")
            .add_edge("a", "a");
        assert!(definition_error(def).contains("cycle detected"));
    }

    #[test]
    fn test_rejects_empty_graph() {
        assert!(definition_error(GraphDefinition::new("g")).contains("no nodes"));
    }

    #[test]
    fn test_successors_and_reachability() {
        let graph = GraphDefinition::new("g")
            .add_node("a", PassStep)
            .add_node("b", PassStep)
            .add_node("c", PassStep)
            .add_node("orphan", PassStep)
            .set_entry("a")
            .add_conditional_edges(
                "a",
                vec![
                    (EdgeCondition::truthy("left"), Target::node("b")),
                    (EdgeCondition::truthy("also_left"), Target::node("b")),
                ],
                "c",
            )
            .set_finish("b")
            .set_finish("c")
            .set_finish("orphan")
            .compile()
            .unwrap();

        assert_eq!(graph.successors("a"), vec![Target::node("b"), Target::node("c")]);
        let reachable = graph.reachable();
        assert!(reachable.contains("c"));
        assert!(!reachable.contains("orphan"));

        let left = State::new().merge(StateDelta::new().set("also_left", true));
        assert_eq!(graph.next_node("a", &left).unwrap(), Target::node("b"));
        assert_eq!(graph.next_node("a", &State::new()).unwrap(), Target::node("c"));
    }
}
