use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::{ElementId, ElementTree, Seat};
use crate::errors::EngineError;
use crate::value::{GameValue, SerializeOpts, SerializedValue};

/// Resolved action arguments, keyed by selection name.
pub type ActionArgs = BTreeMap<String, GameValue>;

/// Wire and storage form of one executed action. The `actions` table and
/// every history payload carry exactly this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedAction {
    pub name: String,
    /// 1-indexed seat that performed the action.
    pub player: Seat,
    pub args: BTreeMap<String, SerializedValue>,
    /// Monotonic milliseconds since session start.
    pub timestamp: u64,
}

/// What kind of value a selection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    /// One of an enumerated list of plain values.
    Choice,
    /// One of an enumerated list of elements.
    Element,
}

/// Schema of one selection step within an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionDef {
    pub name: String,
    pub kind: SelectionKind,
    /// Selections whose values must be known before this one can be
    /// enumerated. Non-empty means the action needs the pending flow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Per-action schema surfaced to clients for building selection UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<SelectionDef>,
}

impl ActionMetadata {
    /// Whether this action must be composed step by step because at least
    /// one selection's choices depend on an earlier selection.
    pub fn has_repeating_selections(&self) -> bool {
        self.selections.iter().any(|s| !s.depends_on.is_empty())
    }
}

/// Multi-select bounds for a selection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSelectConfig {
    pub min: usize,
    pub max: usize,
}

/// The enumerated choices for one selection step, computed against the
/// current game state and any already-made selections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionChoices {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<SerializedValue>,
    #[serde(default, rename = "validElements", skip_serializing_if = "Vec::is_empty")]
    pub valid_elements: Vec<ElementId>,
    #[serde(default, rename = "multiSelect", skip_serializing_if = "Option::is_none")]
    pub multi_select: Option<MultiSelectConfig>,
}

impl SelectionChoices {
    pub fn is_empty(&self) -> bool {
        self.choices.is_empty() && self.valid_elements.is_empty()
    }

    /// Membership check used when validating a submitted selection value.
    pub fn contains(&self, value: &SerializedValue) -> bool {
        if self.choices.iter().any(|c| c == value) {
            return true;
        }
        match value {
            SerializedValue::ElementId(id) => self.valid_elements.contains(id),
            _ => false,
        }
    }
}

/// Encode resolved args for the wire or the action log.
pub fn serialize_action(
    name: &str,
    player: Seat,
    args: &ActionArgs,
    tree: &ElementTree,
    timestamp: u64,
    opts: SerializeOpts,
) -> SerializedAction {
    SerializedAction {
        name: name.to_string(),
        player,
        args: args
            .iter()
            .map(|(k, v)| (k.clone(), v.serialize(tree, opts)))
            .collect(),
        timestamp,
    }
}

/// Resolve a stored or wire action against a live tree.
pub fn deserialize_action(
    action: &SerializedAction,
    tree: &ElementTree,
    player_count: u8,
) -> Result<(String, Seat, ActionArgs), EngineError> {
    let mut args = ActionArgs::new();
    for (key, value) in &action.args {
        args.insert(key.clone(), value.resolve(tree, player_count)?);
    }
    Ok((action.name.clone(), action.player, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Visibility;

    #[test]
    fn repeating_selection_detection() {
        let noop = ActionMetadata { name: "noop".into(), prompt: None, selections: vec![] };
        assert!(!noop.has_repeating_selections());

        let single = ActionMetadata {
            name: "advance".into(),
            prompt: None,
            selections: vec![SelectionDef {
                name: "piece".into(),
                kind: SelectionKind::Element,
                depends_on: vec![],
                prompt: None,
            }],
        };
        assert!(!single.has_repeating_selections());

        let dependent = ActionMetadata {
            name: "move".into(),
            prompt: None,
            selections: vec![
                SelectionDef {
                    name: "piece".into(),
                    kind: SelectionKind::Element,
                    depends_on: vec![],
                    prompt: None,
                },
                SelectionDef {
                    name: "destination".into(),
                    kind: SelectionKind::Choice,
                    depends_on: vec!["piece".into()],
                    prompt: None,
                },
            ],
        };
        assert!(dependent.has_repeating_selections());
    }

    #[test]
    fn action_round_trip() {
        let mut tree = ElementTree::new("table", "root");
        let pawn = tree.add_child(tree.root(), "pawn", "piece", Some(1), Visibility::All);

        let mut args = ActionArgs::new();
        args.insert("piece".into(), GameValue::Element(pawn));
        args.insert("steps".into(), GameValue::Json(serde_json::json!(2)));

        let serialized =
            serialize_action("move", 1, &args, &tree, 17, SerializeOpts::default());
        assert_eq!(serialized.player, 1);
        assert_eq!(serialized.timestamp, 17);
        assert_eq!(
            serialized.args.get("piece"),
            Some(&SerializedValue::ElementId(pawn))
        );

        let (name, seat, resolved) = deserialize_action(&serialized, &tree, 2).unwrap();
        assert_eq!(name, "move");
        assert_eq!(seat, 1);
        assert_eq!(resolved, args);
    }

    #[test]
    fn choice_membership() {
        let choices = SelectionChoices {
            choices: vec![SerializedValue::Number(1.into()), SerializedValue::Number(2.into())],
            valid_elements: vec![4],
            multi_select: None,
        };
        assert!(choices.contains(&SerializedValue::Number(2.into())));
        assert!(choices.contains(&SerializedValue::ElementId(4)));
        assert!(!choices.contains(&SerializedValue::Number(3.into())));
        assert!(!choices.contains(&SerializedValue::ElementId(5)));
    }
}
