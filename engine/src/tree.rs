//! Projection of the store into the module → chapter → material tree.
//!
//! The projection is recomputed from scratch after every store change. The
//! reconciler itself only remembers view state: which nodes are expanded and
//! which unit is selected.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use coursegen_protocol::{Coordinates, MaterialKind, UnitKind};
use serde::{Deserialize, Serialize};

use crate::config::TreeConfig;
use crate::store::ContentUnitStore;
use crate::unit::{ContentUnit, Progress, UnitId, UnitStatus};

/// Identifies an expandable node of the permanent zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum NodeKey {
    Module {
        module_number: u32,
    },
    Chapter {
        module_number: u32,
        chapter_number: u32,
    },
}

impl NodeKey {
    pub fn module(module_number: u32) -> Self {
        Self::Module { module_number }
    }

    pub fn chapter(module_number: u32, chapter_number: u32) -> Self {
        Self::Chapter {
            module_number,
            chapter_number,
        }
    }
}

/// A unit as rendered in either zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub id: UnitId,
    pub title: String,
    pub kind: UnitKind,
    pub material_kind: Option<MaterialKind>,
    pub coordinates: Coordinates,
    pub status: UnitStatus,
    pub awaiting_approval: bool,
    pub selected: bool,
    pub progress: Option<Progress>,
    pub error: Option<String>,
}

/// A chapter of the permanent zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterNode {
    pub module_number: u32,
    pub chapter_number: u32,
    pub title: String,

    /// The complete folder unit backing this chapter, if any.
    pub folder_id: Option<UnitId>,
    pub expanded: bool,
    pub materials: Vec<TreeEntry>,
}

/// A module of the permanent zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub module_number: u32,
    pub title: String,
    pub folder_id: Option<UnitId>,
    pub expanded: bool,
    pub chapters: Vec<ChapterNode>,

    /// Complete materials attached to the module but to no chapter.
    pub materials: Vec<TreeEntry>,
}

/// The render-ready tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeView {
    /// Units still in flight, failed or cancelled, shown above everything else.
    pub pending: Vec<TreeEntry>,

    /// Complete units grouped by module and chapter.
    pub permanent: Vec<ModuleNode>,

    pub selected: Option<UnitId>,
}

impl TreeView {
    /// Every complete material in display order.
    pub fn permanent_entries(&self) -> impl Iterator<Item = &TreeEntry> {
        self.permanent.iter().flat_map(|module| {
            module
                .chapters
                .iter()
                .flat_map(|chapter| chapter.materials.iter())
                .chain(module.materials.iter())
        })
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.pending.iter().any(|e| &e.id == id)
            || self.permanent_entries().any(|e| &e.id == id)
            || self.permanent.iter().any(|m| {
                m.folder_id.as_ref() == Some(id)
                    || m.chapters.iter().any(|c| c.folder_id.as_ref() == Some(id))
            })
    }
}

/// Display order of units.
///
/// Module ascending, the module folder first, then chapters ascending with
/// units lacking a chapter last. Inside a chapter, folders come first, then
/// non-assessment materials before assessments, each by slide number with
/// unnumbered units last.
pub fn compare_units(a: &ContentUnit, b: &ContentUnit) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}

type SortKey = (u32, bool, bool, u32, bool, bool, bool, u32);

fn sort_key(unit: &ContentUnit) -> SortKey {
    let c = unit.coordinates;
    let is_module_folder = unit.is_folder() && c.chapter_number.is_none();
    (
        c.module_number,
        !is_module_folder,
        c.chapter_number.is_none(),
        c.chapter_number.unwrap_or(0),
        !unit.is_folder(),
        unit.is_assessment(),
        c.slide_number.is_none(),
        c.slide_number.unwrap_or(0),
    )
}

/// Units in display order; ties keep store insertion order.
fn sorted<'a>(units: impl Iterator<Item = &'a ContentUnit>) -> Vec<&'a ContentUnit> {
    let mut units: Vec<&ContentUnit> = units.collect();
    units.sort_by(|a, b| compare_units(a, b));
    units
}

/// Derives [`TreeView`]s and keeps expand/selection state.
#[derive(Debug, Clone)]
pub struct TreeReconciler {
    expanded: HashMap<NodeKey, bool>,
    expand_by_default: bool,
    selected: Option<UnitId>,
}

impl Default for TreeReconciler {
    fn default() -> Self {
        Self::new(&TreeConfig::default())
    }
}

impl TreeReconciler {
    pub fn new(config: &TreeConfig) -> Self {
        Self {
            expanded: HashMap::new(),
            expand_by_default: config.expand_by_default,
            selected: None,
        }
    }

    pub fn is_expanded(&self, key: NodeKey) -> bool {
        self.expanded
            .get(&key)
            .copied()
            .unwrap_or(self.expand_by_default)
    }

    pub fn set_expanded(&mut self, key: NodeKey, expanded: bool) {
        self.expanded.insert(key, expanded);
    }

    /// Flip a node and return its new state.
    pub fn toggle(&mut self, key: NodeKey) -> bool {
        let expanded = !self.is_expanded(key);
        self.set_expanded(key, expanded);
        expanded
    }

    /// Expand the module and chapter containing `coordinates`.
    pub fn reveal(&mut self, coordinates: Coordinates) {
        self.set_expanded(NodeKey::module(coordinates.module_number), true);
        if let Some(chapter) = coordinates.chapter_number {
            self.set_expanded(NodeKey::chapter(coordinates.module_number, chapter), true);
        }
    }

    pub fn select(&mut self, id: Option<UnitId>) {
        self.selected = id;
    }

    pub fn selected(&self) -> Option<&UnitId> {
        self.selected.as_ref()
    }

    /// Drop the selection if it points at `id`.
    pub fn forget(&mut self, id: &UnitId) {
        if self.selected.as_ref() == Some(id) {
            self.selected = None;
        }
    }

    /// Drop the selection if its unit is no longer in the store.
    pub fn retain(&mut self, store: &ContentUnitStore) {
        if self.selected.as_ref().is_some_and(|id| !store.contains(id)) {
            self.selected = None;
        }
    }

    /// Compute the tree for the current store contents.
    pub fn project(&self, store: &ContentUnitStore) -> TreeView {
        let selected = self.selected.clone().filter(|id| store.contains(id));

        let pending = sorted(store.iter().filter(|u| u.status != UnitStatus::Complete))
            .into_iter()
            .map(|u| self.entry(u, selected.as_ref()))
            .collect();

        let mut modules: BTreeMap<u32, ModuleNode> = BTreeMap::new();
        let mut chapters: BTreeMap<(u32, u32), ChapterNode> = BTreeMap::new();

        for unit in sorted(store.iter().filter(|u| u.status == UnitStatus::Complete)) {
            let c = unit.coordinates;
            let module = modules
                .entry(c.module_number)
                .or_insert_with(|| self.module_node(c.module_number));

            match (unit.kind, c.chapter_number) {
                (UnitKind::Folder, None) => {
                    module.title = unit.display_title();
                    module.folder_id = Some(unit.id.clone());
                }
                (UnitKind::Folder, Some(chapter_number)) => {
                    let chapter = chapters
                        .entry((c.module_number, chapter_number))
                        .or_insert_with(|| self.chapter_node(c.module_number, chapter_number));
                    chapter.title = unit.display_title();
                    chapter.folder_id = Some(unit.id.clone());
                }
                (UnitKind::File, None) => {
                    module.materials.push(self.entry(unit, selected.as_ref()));
                }
                (UnitKind::File, Some(chapter_number)) => {
                    chapters
                        .entry((c.module_number, chapter_number))
                        .or_insert_with(|| self.chapter_node(c.module_number, chapter_number))
                        .materials
                        .push(self.entry(unit, selected.as_ref()));
                }
            }
        }

        for ((module_number, _), chapter) in chapters {
            modules
                .entry(module_number)
                .or_insert_with(|| self.module_node(module_number))
                .chapters
                .push(chapter);
        }

        TreeView {
            pending,
            permanent: modules.into_values().collect(),
            selected,
        }
    }

    fn module_node(&self, module_number: u32) -> ModuleNode {
        ModuleNode {
            module_number,
            title: format!("Module {module_number}"),
            folder_id: None,
            expanded: self.is_expanded(NodeKey::module(module_number)),
            chapters: Vec::new(),
            materials: Vec::new(),
        }
    }

    fn chapter_node(&self, module_number: u32, chapter_number: u32) -> ChapterNode {
        ChapterNode {
            module_number,
            chapter_number,
            title: format!("Chapter {chapter_number}"),
            folder_id: None,
            expanded: self.is_expanded(NodeKey::chapter(module_number, chapter_number)),
            materials: Vec::new(),
        }
    }

    fn entry(&self, unit: &ContentUnit, selected: Option<&UnitId>) -> TreeEntry {
        TreeEntry {
            id: unit.id.clone(),
            title: unit.display_title(),
            kind: unit.kind,
            material_kind: unit.material_kind,
            coordinates: unit.coordinates,
            status: unit.status,
            awaiting_approval: unit.is_awaiting_approval(),
            selected: selected == Some(&unit.id),
            progress: unit.progress.clone(),
            error: unit.error.clone(),
        }
    }
}
