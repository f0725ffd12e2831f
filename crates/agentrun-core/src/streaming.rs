// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Incremental-update UI surface model. Not rendered by this crate (the TUI
//! is out of scope); this is the data structure a renderer mirrors, kept here
//! because merge-by-id and patch-application are core-contract invariants.
use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

/// A single renderable component, identified by a stable id.
#[derive(Debug, Clone)]
pub struct Component {
    pub id: String,
    pub component_type: String,
    pub properties: Value,
    /// Ids of child components, in render order.
    pub children: Vec<String>,
}

/// UI-only state that must survive incremental updates (scroll position,
/// focus, in-flight input) and is cleared only by `delete_surface`.
#[derive(Debug, Clone, Default)]
pub struct PreservedState {
    pub scroll_position: Option<f64>,
    pub focused_id: Option<String>,
    pub pending_input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    /// Root and full tree are known.
    Complete,
    /// Root or children are still arriving as further surfaceUpdates.
    Streaming,
}

/// A named UI region: its component map, data model, and render state.
#[derive(Debug, Clone)]
pub struct Surface {
    pub id: String,
    pub components: HashMap<String, Component>,
    pub data_model: Value,
    pub root_id: Option<String>,
    pub streaming_state: StreamingState,
    pub preserved_state: PreservedState,
}

impl Surface {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            components: HashMap::new(),
            data_model: Value::Object(serde_json::Map::new()),
            root_id: None,
            streaming_state: StreamingState::Streaming,
            preserved_state: PreservedState::default(),
        }
    }

    /// Detect a cycle reachable from `start` through the current child graph.
    fn has_cycle_from(&self, start: &str) -> bool {
        let mut visiting: Vec<String> = vec![start.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = visiting.pop() {
            if !seen.insert(id.clone()) {
                return true;
            }
            if let Some(c) = self.components.get(&id) {
                for child in &c.children {
                    visiting.push(child.clone());
                }
            }
        }
        false
    }
}

/// The messages a renderer (or this in-process mirror) consumes.
#[derive(Debug, Clone)]
pub enum StreamingMessage {
    /// Merge the given components into the surface's component map by id.
    SurfaceUpdate { surface_id: String, components: Vec<Component> },
    /// Apply `contents` at the JSON-pointer `path` in the surface's data model.
    DataModelUpdate { surface_id: String, path: String, contents: Value },
    /// Set the root and (re)build the tree from current components.
    BeginRendering { surface_id: String, root_id: String },
    /// Remove the surface and all associated state.
    DeleteSurface { surface_id: String },
}

/// Registry of all known surfaces, keyed by surface id.
pub struct SurfaceRegistry {
    surfaces: Mutex<HashMap<String, Surface>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self { surfaces: Mutex::new(HashMap::new()) }
    }

    pub fn apply(&self, msg: StreamingMessage) {
        let mut surfaces = self.surfaces.lock().unwrap();
        match msg {
            StreamingMessage::SurfaceUpdate { surface_id, components } => {
                let surface = surfaces.entry(surface_id.clone()).or_insert_with(|| Surface::new(&surface_id));
                for c in components {
                    if c.children.iter().any(|child| *child == c.id) {
                        warn!(component = %c.id, "dropping component with self-referential child");
                        continue;
                    }
                    surface.components.insert(c.id.clone(), c);
                }
                // Drop any component whose child graph now contains a cycle,
                // rather than letting the renderer recurse forever.
                let cyclic: Vec<String> = surface
                    .components
                    .keys()
                    .filter(|id| surface.has_cycle_from(id))
                    .cloned()
                    .collect();
                for id in cyclic {
                    warn!(component = %id, "dropping component reachable via a circular child reference");
                    surface.components.remove(&id);
                }
            }
            StreamingMessage::DataModelUpdate { surface_id, path, contents } => {
                let surface = surfaces.entry(surface_id.clone()).or_insert_with(|| Surface::new(&surface_id));
                set_json_pointer(&mut surface.data_model, &path, contents);
            }
            StreamingMessage::BeginRendering { surface_id, root_id } => {
                let surface = surfaces.entry(surface_id.clone()).or_insert_with(|| Surface::new(&surface_id));
                surface.root_id = Some(root_id.clone());
                surface.streaming_state = if surface.components.contains_key(&root_id) {
                    StreamingState::Complete
                } else {
                    StreamingState::Streaming
                };
            }
            StreamingMessage::DeleteSurface { surface_id } => {
                surfaces.remove(&surface_id);
            }
        }
    }

    pub fn get(&self, surface_id: &str) -> Option<Surface> {
        self.surfaces.lock().unwrap().get(surface_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.surfaces.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SurfaceRegistry {
    fn default() -> Self { Self::new() }
}

/// Set `contents` at `pointer` (RFC 6901 JSON Pointer) within `root`,
/// creating intermediate objects as needed, preserving sibling keys.
fn set_json_pointer(root: &mut Value, pointer: &str, contents: Value) {
    if pointer.is_empty() || pointer == "/" {
        *root = contents;
        return;
    }
    let parts: Vec<String> = pointer
        .trim_start_matches('/')
        .split('/')
        .map(|p| p.replace("~1", "/").replace("~0", "~"))
        .collect();

    let mut cursor = root;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        let map = cursor.as_object_mut().unwrap();
        if is_last {
            map.insert(part.clone(), contents);
            return;
        }
        cursor = map.entry(part.clone()).or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Resolve `pointer` against `root`, returning `None` if any segment is absent.
pub fn get_json_pointer<'a>(root: &'a Value, pointer: &str) -> Option<&'a Value> {
    if pointer.is_empty() || pointer == "/" {
        return Some(root);
    }
    let mut cursor = root;
    for part in pointer.trim_start_matches('/').split('/') {
        let key = part.replace("~1", "/").replace("~0", "~");
        cursor = cursor.as_object()?.get(&key)?;
    }
    Some(cursor)
}

/// Delete the value at `pointer`, if present.
pub fn delete_json_pointer(root: &mut Value, pointer: &str) {
    let parts: Vec<String> = pointer
        .trim_start_matches('/')
        .split('/')
        .map(|p| p.replace("~1", "/").replace("~0", "~"))
        .collect();
    if parts.is_empty() {
        return;
    }
    let mut cursor = root;
    for part in &parts[..parts.len() - 1] {
        match cursor.as_object_mut().and_then(|m| m.get_mut(part)) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(map) = cursor.as_object_mut() {
        map.remove(&parts[parts.len() - 1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comp(id: &str, children: &[&str]) -> Component {
        Component {
            id: id.to_string(),
            component_type: "Text".into(),
            properties: json!({}),
            children: children.iter().map(|s| s.to_string()).collect(),
        }
    }

    // ── Merge-by-id ───────────────────────────────────────────────────────────

    #[test]
    fn surface_update_merges_components_by_id() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate {
            surface_id: "s1".into(),
            components: vec![comp("x", &[])],
        });
        reg.apply(StreamingMessage::SurfaceUpdate {
            surface_id: "s1".into(),
            components: vec![comp("y", &[])],
        });
        let s = reg.get("s1").unwrap();
        assert_eq!(s.components.len(), 2);
    }

    #[test]
    fn updating_same_id_twice_keeps_later_definition() {
        let reg = SurfaceRegistry::new();
        let mut first = comp("x", &[]);
        first.properties = json!({"text": "first"});
        let mut second = comp("x", &[]);
        second.properties = json!({"text": "second"});
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s1".into(), components: vec![first] });
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s1".into(), components: vec![second] });
        let s = reg.get("s1").unwrap();
        assert_eq!(s.components.len(), 1);
        assert_eq!(s.components["x"].properties["text"], "second");
    }

    #[test]
    fn s6_ui_merge_by_id_scenario() {
        let reg = SurfaceRegistry::new();
        let mut x1 = comp("x", &[]);
        x1.properties = json!({"Text": "first"});
        let mut x2 = comp("x", &[]);
        x2.properties = json!({"Text": "second"});
        let y = comp("y", &[]);
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![x1] });
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![x2] });
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![y] });
        let s = reg.get("s").unwrap();
        assert_eq!(s.components.len(), 2);
        assert_eq!(s.components["x"].properties["Text"], "second");
        assert_eq!(s.components["y"].properties["Text"], json!(null));
    }

    // ── Circular references ──────────────────────────────────────────────────

    #[test]
    fn self_referential_child_is_dropped() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate {
            surface_id: "s".into(),
            components: vec![comp("x", &["x"])],
        });
        let s = reg.get("s").unwrap();
        assert!(!s.components.contains_key("x"));
    }

    #[test]
    fn mutual_cycle_is_dropped() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate {
            surface_id: "s".into(),
            components: vec![comp("a", &["b"]), comp("b", &["a"])],
        });
        let s = reg.get("s").unwrap();
        assert!(s.components.is_empty());
    }

    #[test]
    fn acyclic_tree_is_preserved() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate {
            surface_id: "s".into(),
            components: vec![comp("root", &["a", "b"]), comp("a", &[]), comp("b", &[])],
        });
        let s = reg.get("s").unwrap();
        assert_eq!(s.components.len(), 3);
    }

    // ── beginRendering / streaming state ─────────────────────────────────────

    #[test]
    fn begin_rendering_sets_root_and_resolves_when_known() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![comp("root", &[])] });
        reg.apply(StreamingMessage::BeginRendering { surface_id: "s".into(), root_id: "root".into() });
        let s = reg.get("s").unwrap();
        assert_eq!(s.root_id.as_deref(), Some("root"));
        assert_eq!(s.streaming_state, StreamingState::Complete);
    }

    #[test]
    fn begin_rendering_before_root_exists_stays_streaming() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::BeginRendering { surface_id: "s".into(), root_id: "root".into() });
        let s = reg.get("s").unwrap();
        assert_eq!(s.streaming_state, StreamingState::Streaming);
    }

    // ── deleteSurface ─────────────────────────────────────────────────────────

    #[test]
    fn delete_surface_removes_everything() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![comp("x", &[])] });
        reg.apply(StreamingMessage::DeleteSurface { surface_id: "s".into() });
        assert!(reg.get("s").is_none());
    }

    #[test]
    fn preserved_state_survives_updates_and_is_cleared_on_delete() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![comp("x", &[])] });
        {
            let mut surfaces = reg.surfaces.lock().unwrap();
            surfaces.get_mut("s").unwrap().preserved_state.scroll_position = Some(42.0);
        }
        reg.apply(StreamingMessage::SurfaceUpdate { surface_id: "s".into(), components: vec![comp("y", &[])] });
        assert_eq!(reg.get("s").unwrap().preserved_state.scroll_position, Some(42.0));
        reg.apply(StreamingMessage::DeleteSurface { surface_id: "s".into() });
        assert!(reg.get("s").is_none());
    }

    // ── JSON pointer ──────────────────────────────────────────────────────────

    #[test]
    fn set_and_get_pointer_roundtrip() {
        let mut root = json!({});
        set_json_pointer(&mut root, "/a/b", json!(42));
        assert_eq!(get_json_pointer(&root, "/a/b"), Some(&json!(42)));
    }

    #[test]
    fn set_preserves_sibling_keys() {
        let mut root = json!({"a": {"x": 1, "y": 2}});
        set_json_pointer(&mut root, "/a/x", json!(99));
        assert_eq!(root["a"]["x"], json!(99));
        assert_eq!(root["a"]["y"], json!(2));
    }

    #[test]
    fn delete_then_get_returns_none() {
        let mut root = json!({"a": {"b": 1}});
        delete_json_pointer(&mut root, "/a/b");
        assert_eq!(get_json_pointer(&root, "/a/b"), None);
    }

    #[test]
    fn get_missing_path_returns_none() {
        let root = json!({"a": 1});
        assert_eq!(get_json_pointer(&root, "/missing/path"), None);
    }

    #[test]
    fn data_model_update_applies_through_registry() {
        let reg = SurfaceRegistry::new();
        reg.apply(StreamingMessage::DataModelUpdate {
            surface_id: "s".into(),
            path: "/count".into(),
            contents: json!(1),
        });
        let s = reg.get("s").unwrap();
        assert_eq!(get_json_pointer(&s.data_model, "/count"), Some(&json!(1)));
    }
}
