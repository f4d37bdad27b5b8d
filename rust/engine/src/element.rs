use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 1-indexed player position within a game. Stable for the session lifetime.
pub type Seat = u8;

/// Stable identifier of an element within a game's tree. Ids are assigned
/// in creation order and never reused, so they survive serialization and
/// replay of the same action log.
pub type ElementId = u32;

/// Who may see an element's attributes and contents.
///
/// The policy is set by game rules at setup or via actions; the view code
/// applies it without interpreting anything game-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to every seat and to spectators.
    All,
    /// Hidden from everyone (face-down pile).
    Hidden,
    /// Visible only to the owning seat.
    Owner,
}

/// One node of a game's element tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<Seat>,
    pub visibility: Visibility,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<ElementId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ElementId>,
}

impl Element {
    /// Whether this element's attributes and contents are visible to `seat`.
    /// `None` is the spectator view and sees only `Visibility::All`.
    pub fn visible_to(&self, seat: Option<Seat>) -> bool {
        match self.visibility {
            Visibility::All => true,
            Visibility::Hidden => false,
            Visibility::Owner => seat.is_some() && self.owner == seat,
        }
    }
}

/// Arena-backed element tree. Nodes own child ids, never pointers, so the
/// whole structure serializes as a flat list and rebuilds by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementTree {
    nodes: Vec<Element>,
    root: ElementId,
}

impl ElementTree {
    pub fn new(root_name: impl Into<String>, root_kind: impl Into<String>) -> Self {
        let root = Element {
            id: 0,
            name: root_name.into(),
            kind: root_kind.into(),
            owner: None,
            visibility: Visibility::All,
            attributes: Map::new(),
            children: Vec::new(),
            parent: None,
        };
        Self { nodes: vec![root], root: 0 }
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a child under `parent`. Returns the new element's id.
    pub fn add_child(
        &mut self,
        parent: ElementId,
        name: impl Into<String>,
        kind: impl Into<String>,
        owner: Option<Seat>,
        visibility: Visibility,
    ) -> ElementId {
        let id = self.nodes.len() as ElementId;
        self.nodes.push(Element {
            id,
            name: name.into(),
            kind: kind.into(),
            owner,
            visibility,
            attributes: Map::new(),
            children: Vec::new(),
            parent: Some(parent),
        });
        if let Some(node) = self.nodes.get_mut(parent as usize) {
            node.children.push(id);
        }
        id
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.nodes.get(id as usize)
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.nodes.get_mut(id as usize)
    }

    pub fn set_attribute(&mut self, id: ElementId, key: impl Into<String>, value: Value) {
        if let Some(node) = self.nodes.get_mut(id as usize) {
            node.attributes.insert(key.into(), value);
        }
    }

    pub fn attribute(&self, id: ElementId, key: &str) -> Option<&Value> {
        self.get(id).and_then(|node| node.attributes.get(key))
    }

    /// Branch path of an element: child indices from the root joined with
    /// `/`, root itself being `0`. Example: the second child of the first
    /// child of the root is `0/0/1`.
    pub fn branch_path(&self, id: ElementId) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent_id) = current.parent {
            let parent = self.get(parent_id)?;
            let index = parent.children.iter().position(|c| *c == current.id)?;
            segments.push(index.to_string());
            current = parent;
        }
        segments.push("0".to_string());
        segments.reverse();
        Some(segments.join("/"))
    }

    /// Resolve a branch path produced by [`branch_path`](Self::branch_path).
    pub fn by_branch_path(&self, path: &str) -> Option<&Element> {
        let mut parts = path.split('/');
        if parts.next()? != "0" {
            return None;
        }
        let mut current = self.get(self.root)?;
        for part in parts {
            let index: usize = part.parse().ok()?;
            let child_id = *current.children.get(index)?;
            current = self.get(child_id)?;
        }
        Some(current)
    }

    /// Iterate elements in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter()
    }

    /// Find the first element matching a predicate, depth-first from root.
    pub fn find(&self, mut pred: impl FnMut(&Element) -> bool) -> Option<&Element> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.get(id)?;
            if pred(node) {
                return Some(node);
            }
            for child in node.children.iter().rev() {
                stack.push(*child);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> (ElementTree, ElementId, ElementId, ElementId) {
        let mut tree = ElementTree::new("table", "root");
        let track = tree.add_child(tree.root(), "track", "board", None, Visibility::All);
        let pawn = tree.add_child(track, "pawn", "piece", Some(1), Visibility::All);
        let hand = tree.add_child(tree.root(), "hand", "container", Some(2), Visibility::Owner);
        (tree, track, pawn, hand)
    }

    #[test]
    fn ids_are_stable_and_indexable() {
        let (tree, track, pawn, hand) = sample_tree();
        assert_eq!(tree.get(track).unwrap().name, "track");
        assert_eq!(tree.get(pawn).unwrap().parent, Some(track));
        assert_eq!(tree.get(hand).unwrap().owner, Some(2));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn branch_paths_round_trip() {
        let (tree, track, pawn, hand) = sample_tree();
        assert_eq!(tree.branch_path(tree.root()).unwrap(), "0");
        assert_eq!(tree.branch_path(track).unwrap(), "0/0");
        assert_eq!(tree.branch_path(pawn).unwrap(), "0/0/0");
        assert_eq!(tree.branch_path(hand).unwrap(), "0/1");

        for id in [tree.root(), track, pawn, hand] {
            let path = tree.branch_path(id).unwrap();
            assert_eq!(tree.by_branch_path(&path).unwrap().id, id);
        }
        assert!(tree.by_branch_path("0/7").is_none());
        assert!(tree.by_branch_path("1").is_none());
    }

    #[test]
    fn visibility_policy_applies_per_seat() {
        let (tree, _, _, hand) = sample_tree();
        let hand = tree.get(hand).unwrap();
        assert!(hand.visible_to(Some(2)));
        assert!(!hand.visible_to(Some(1)));
        assert!(!hand.visible_to(None));

        let root = tree.get(tree.root()).unwrap();
        assert!(root.visible_to(None));
    }

    #[test]
    fn tree_serializes_and_rebuilds() {
        let (mut tree, track, _, _) = sample_tree();
        tree.set_attribute(track, "len", json!(8));

        let encoded = serde_json::to_value(&tree).expect("serialize tree");
        let decoded: ElementTree = serde_json::from_value(encoded).expect("deserialize tree");
        assert_eq!(decoded, tree);
        assert_eq!(decoded.attribute(track, "len"), Some(&json!(8)));
    }
}
