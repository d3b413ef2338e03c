//! The launch graph: named groups of nodes, built by the caller before any
//! backend touches it.

pub mod address;
pub mod handle;
pub mod node;

use anyhow::Result;
use handle::Handle;
use node::{Node, NodeId, NodeIdentity};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    EmptyLabel,
    LabelMismatch { current: String, requested: String },
    NestedGroup { current: String, requested: String },
    DuplicateNode { label: String },
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramError::EmptyLabel => write!(f, "node label must not be empty"),
            ProgramError::LabelMismatch { current, requested } => write!(
                f,
                "label {requested} does not match the current group {current}"
            ),
            ProgramError::NestedGroup { current, requested } => write!(
                f,
                "cannot open group {requested} inside group {current}; groups do not nest"
            ),
            ProgramError::DuplicateNode { label } => {
                write!(f, "node was already added to the program (group {label})")
            }
        }
    }
}

impl std::error::Error for ProgramError {}

#[derive(Debug, Clone)]
pub struct Group {
    label: String,
    nodes: Vec<Node>,
}

impl Group {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Host shared by the group, taken from its first node.
    pub fn host(&self) -> Option<&str> {
        self.nodes.first().and_then(Node::host)
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    groups: Vec<Group>,
    current_group: Option<String>,
    node_ids: HashSet<NodeId>,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            current_group: None,
            node_ids: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends `node` to its group and returns a handle to it.
    ///
    /// Outside a [`Program::group`] scope the label is required. Inside one it
    /// may be omitted, and if given it must match the open group.
    pub fn add_node(&mut self, mut node: Node, label: Option<&str>) -> Result<Handle, ProgramError> {
        let label = match (&self.current_group, label) {
            (Some(current), Some(requested)) if current != requested => {
                return Err(ProgramError::LabelMismatch {
                    current: current.clone(),
                    requested: requested.to_string(),
                });
            }
            (Some(current), _) => current.clone(),
            (None, Some(requested)) if !requested.is_empty() => requested.to_string(),
            (None, _) => return Err(ProgramError::EmptyLabel),
        };

        if !self.node_ids.insert(node.id()) {
            return Err(ProgramError::DuplicateNode { label });
        }

        let position = match self.groups.iter().position(|group| group.label == label) {
            Some(position) => position,
            None => {
                self.groups.push(Group {
                    label: label.clone(),
                    nodes: Vec::new(),
                });
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[position];
        let identity = NodeIdentity {
            label,
            index: group.nodes.len(),
        };
        node.set_identity(identity.clone());
        let handle = Handle::new(identity, node.addresses().first().cloned());
        group.nodes.push(node);
        Ok(handle)
    }

    /// Runs `build` with `label` as the current group. The scope is closed
    /// again whether or not `build` succeeds.
    pub fn group<T>(&mut self, label: &str, build: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if label.is_empty() {
            return Err(ProgramError::EmptyLabel.into());
        }
        if let Some(current) = &self.current_group {
            return Err(ProgramError::NestedGroup {
                current: current.clone(),
                requested: label.to_string(),
            }
            .into());
        }

        self.current_group = Some(label.to_string());
        let result = build(self);
        self.current_group = None;
        result
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_group.as_deref()
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// All nodes in canonical order: groups in insertion order, then index
    /// within each group. Task indices and artifact layout follow this order.
    pub fn get_all_nodes(&self) -> Vec<&Node> {
        self.groups.iter().flat_map(|group| group.nodes.iter()).collect()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.groups.iter_mut().flat_map(|group| group.nodes.iter_mut())
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(Group::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPoint;

    fn node() -> Node {
        Node::new(EntryPoint::new("noop"))
    }

    #[test]
    fn enumerates_groups_then_indices() {
        let mut program = Program::new("job");
        program.add_node(node(), Some("actor")).unwrap();
        program.add_node(node(), Some("learner")).unwrap();
        program.add_node(node(), Some("actor")).unwrap();
        program.add_node(node(), Some("replay")).unwrap();

        let identities: Vec<String> = program
            .get_all_nodes()
            .iter()
            .map(|node| node.identity().unwrap().to_string())
            .collect();
        assert_eq!(identities, ["actor/0", "actor/1", "learner/0", "replay/0"]);
        assert_eq!(program.len(), 4);
        assert_eq!(
            program.groups().iter().map(Group::len).sum::<usize>(),
            program.get_all_nodes().len()
        );
    }

    #[test]
    fn empty_label_outside_group_fails() {
        let mut program = Program::new("job");
        assert_eq!(
            program.add_node(node(), None).unwrap_err(),
            ProgramError::EmptyLabel
        );
        assert_eq!(
            program.add_node(node(), Some("")).unwrap_err(),
            ProgramError::EmptyLabel
        );
        assert!(program.is_empty());
    }

    #[test]
    fn group_scope_accepts_missing_or_matching_label() {
        let mut program = Program::new("job");
        program
            .group("actor", |program| {
                program.add_node(node(), None)?;
                program.add_node(node(), Some("actor"))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(program.groups()[0].len(), 2);
        assert_eq!(program.current_group(), None);
    }

    #[test]
    fn mismatched_label_inside_group_fails() {
        let mut program = Program::new("job");
        let err = program
            .group("actor", |program| {
                program.add_node(node(), Some("learner"))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProgramError>(),
            Some(&ProgramError::LabelMismatch {
                current: "actor".into(),
                requested: "learner".into(),
            })
        );
        assert_eq!(program.current_group(), None);
        assert!(program.is_empty());
    }

    #[test]
    fn nested_group_fails_fast() {
        let mut program = Program::new("job");
        let err = program
            .group("actor", |program| program.group("learner", |_| Ok(())))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProgramError>(),
            Some(ProgramError::NestedGroup { .. })
        ));
        assert_eq!(program.current_group(), None);
    }

    #[test]
    fn adding_a_node_twice_fails() {
        let mut program = Program::new("job");
        let shared = node();
        program.add_node(shared.clone(), Some("actor")).unwrap();
        let err = program.add_node(shared, Some("learner")).unwrap_err();
        assert!(matches!(err, ProgramError::DuplicateNode { .. }));
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn handle_tracks_first_address() {
        let mut program = Program::new("job");
        let mut server = node();
        server.allocate_address("rpc");
        server.allocate_address("metrics");
        let handle = program.add_node(server, Some("server")).unwrap();
        assert_eq!(handle.target().to_string(), "server/0");
        assert_eq!(handle.address().map(|a| a.name()), Some("rpc".to_string()));
    }
}
