use std::collections::BTreeMap;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::element::{ElementId, ElementTree, Seat};
use crate::errors::EngineError;

const ELEMENT_ID_KEY: &str = "__elementId";
const ELEMENT_REF_KEY: &str = "__elementRef";
const PLAYER_REF_KEY: &str = "__playerRef";

/// A JSON value with reserved discriminators for engine references.
///
/// This is the wire form of everything a client sends in action args and
/// everything the server persists in the action log. References stay
/// symbolic here; [`SerializedValue::resolve`] turns them into live
/// [`GameValue`]s against a concrete game tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    ElementId(ElementId),
    ElementRef(String),
    PlayerRef(Seat),
    List(Vec<SerializedValue>),
    Map(BTreeMap<String, SerializedValue>),
}

/// A value resolved against a live game. Element and player references
/// are validated; plain JSON passes through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum GameValue {
    Json(Value),
    Element(ElementId),
    Player(Seat),
    List(Vec<GameValue>),
    Map(BTreeMap<String, GameValue>),
}

/// Options for reference encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializeOpts {
    /// Encode element references as branch paths instead of stable ids.
    pub use_branch_paths: bool,
}

impl SerializedValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SerializedValue::Null,
            Value::Bool(b) => SerializedValue::Bool(*b),
            Value::Number(n) => SerializedValue::Number(n.clone()),
            Value::String(s) => SerializedValue::String(s.clone()),
            Value::Array(items) => {
                SerializedValue::List(items.iter().map(Self::from_json).collect())
            }
            Value::Object(map) => Self::from_object(map),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Self {
        if let Some(id) = map.get(ELEMENT_ID_KEY).and_then(Value::as_u64) {
            return SerializedValue::ElementId(id as ElementId);
        }
        if let Some(path) = map.get(ELEMENT_REF_KEY).and_then(Value::as_str) {
            return SerializedValue::ElementRef(path.to_string());
        }
        if let Some(seat) = map.get(PLAYER_REF_KEY).and_then(Value::as_u64) {
            return SerializedValue::PlayerRef(seat as Seat);
        }
        SerializedValue::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), Self::from_json(v)))
                .collect(),
        )
    }

    pub fn to_json(&self) -> Value {
        match self {
            SerializedValue::Null => Value::Null,
            SerializedValue::Bool(b) => Value::Bool(*b),
            SerializedValue::Number(n) => Value::Number(n.clone()),
            SerializedValue::String(s) => Value::String(s.clone()),
            SerializedValue::ElementId(id) => {
                let mut map = Map::new();
                map.insert(ELEMENT_ID_KEY.to_string(), Value::from(*id));
                Value::Object(map)
            }
            SerializedValue::ElementRef(path) => {
                let mut map = Map::new();
                map.insert(ELEMENT_REF_KEY.to_string(), Value::String(path.clone()));
                Value::Object(map)
            }
            SerializedValue::PlayerRef(seat) => {
                let mut map = Map::new();
                map.insert(PLAYER_REF_KEY.to_string(), Value::from(*seat));
                Value::Object(map)
            }
            SerializedValue::List(items) => {
                Value::Array(items.iter().map(Self::to_json).collect())
            }
            SerializedValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Resolve references against a live tree. Fails `DanglingRef` on a
    /// missing element, an unknown branch path, or an out-of-range seat.
    pub fn resolve(
        &self,
        tree: &ElementTree,
        player_count: u8,
    ) -> Result<GameValue, EngineError> {
        match self {
            SerializedValue::Null => Ok(GameValue::Json(Value::Null)),
            SerializedValue::Bool(b) => Ok(GameValue::Json(Value::Bool(*b))),
            SerializedValue::Number(n) => Ok(GameValue::Json(Value::Number(n.clone()))),
            SerializedValue::String(s) => Ok(GameValue::Json(Value::String(s.clone()))),
            SerializedValue::ElementId(id) => {
                if tree.get(*id).is_some() {
                    Ok(GameValue::Element(*id))
                } else {
                    Err(EngineError::DanglingRef(format!("element id {id}")))
                }
            }
            SerializedValue::ElementRef(path) => tree
                .by_branch_path(path)
                .map(|el| GameValue::Element(el.id))
                .ok_or_else(|| EngineError::DanglingRef(format!("element path {path}"))),
            SerializedValue::PlayerRef(seat) => {
                if *seat >= 1 && *seat <= player_count {
                    Ok(GameValue::Player(*seat))
                } else {
                    Err(EngineError::DanglingRef(format!("player seat {seat}")))
                }
            }
            SerializedValue::List(items) => items
                .iter()
                .map(|item| item.resolve(tree, player_count))
                .collect::<Result<Vec<_>, _>>()
                .map(GameValue::List),
            SerializedValue::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve(tree, player_count)?)))
                .collect::<Result<BTreeMap<_, _>, EngineError>>()
                .map(GameValue::Map),
        }
    }
}

impl GameValue {
    /// Re-encode a live value for the wire.
    pub fn serialize(&self, tree: &ElementTree, opts: SerializeOpts) -> SerializedValue {
        match self {
            GameValue::Json(value) => SerializedValue::from_json(value),
            GameValue::Element(id) => {
                if opts.use_branch_paths {
                    match tree.branch_path(*id) {
                        Some(path) => SerializedValue::ElementRef(path),
                        None => SerializedValue::ElementId(*id),
                    }
                } else {
                    SerializedValue::ElementId(*id)
                }
            }
            GameValue::Player(seat) => SerializedValue::PlayerRef(*seat),
            GameValue::List(items) => SerializedValue::List(
                items.iter().map(|item| item.serialize(tree, opts)).collect(),
            ),
            GameValue::Map(map) => SerializedValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.serialize(tree, opts)))
                    .collect(),
            ),
        }
    }

    pub fn as_element(&self) -> Option<ElementId> {
        match self {
            GameValue::Element(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_seat(&self) -> Option<Seat> {
        match self {
            GameValue::Player(seat) => Some(*seat),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GameValue::Json(Value::Number(n)) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GameValue::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// Whether a JSON value is one of the reserved reference forms.
pub fn is_serialized_reference(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(ELEMENT_ID_KEY)
                || map.contains_key(ELEMENT_REF_KEY)
                || map.contains_key(PLAYER_REF_KEY)
        }
        _ => false,
    }
}

impl Serialize for SerializedValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if let Value::Object(map) = &value {
            if map.contains_key(ELEMENT_ID_KEY)
                && map.get(ELEMENT_ID_KEY).and_then(Value::as_u64).is_none()
            {
                return Err(D::Error::custom("__elementId must be an unsigned integer"));
            }
            if map.contains_key(PLAYER_REF_KEY)
                && map.get(PLAYER_REF_KEY).and_then(Value::as_u64).is_none()
            {
                return Err(D::Error::custom("__playerRef must be an unsigned integer"));
            }
        }
        Ok(SerializedValue::from_json(&value))
    }
}
