//! In-memory view of the compositor's heads and their modes.
//!
//! The model is mutated one protocol event at a time, in the order the events
//! arrive. It never decides when the set is consistent: callers take a
//! [`Snapshot`] only once the compositor has sent its `done` event.

use std::collections::HashMap;

use crate::profile::{Position, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub id: ModeId,
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz, 0 when unknown
    pub refresh: i32,
    pub preferred: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Head {
    pub id: HeadId,
    pub name: String,
    pub description: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    /// Physical size in millimetres
    pub physical_size: (i32, i32),
    pub enabled: bool,
    pub current_mode: Option<ModeId>,
    pub position: Position,
    pub transform: Transform,
    pub scale: f64,
    pub adaptive_sync: Option<bool>,
    pub modes: Vec<Mode>,
}

impl Head {
    fn new(id: HeadId) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            make: None,
            model: None,
            serial_number: None,
            physical_size: (0, 0),
            enabled: false,
            current_mode: None,
            position: Position::default(),
            transform: Transform::Normal,
            scale: 1.0,
            adaptive_sync: None,
            modes: Vec::new(),
        }
    }

    pub fn mode(&self, id: ModeId) -> Option<&Mode> {
        self.modes.iter().find(|mode| mode.id == id)
    }

    pub fn current_mode(&self) -> Option<&Mode> {
        self.current_mode.and_then(|id| self.mode(id))
    }
}

/// A single head property update
#[derive(Debug, Clone, PartialEq)]
pub enum HeadField {
    Name(String),
    Description(String),
    Make(String),
    Model(String),
    SerialNumber(String),
    PhysicalSize { width: i32, height: i32 },
    Enabled(bool),
    CurrentMode(ModeId),
    Position { x: i32, y: i32 },
    Transform(Transform),
    Scale(f64),
    AdaptiveSync(bool),
}

/// A single mode property update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeField {
    Size { width: i32, height: i32 },
    Refresh(i32),
    Preferred,
}

/// Heads of one `done` generation, copied out of the model
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub serial: u32,
    pub heads: Vec<Head>,
}

#[derive(Debug, Default)]
pub struct Topology {
    heads: Vec<Head>,
    mode_owners: HashMap<ModeId, HeadId>,
    next_id: u64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_head(&mut self) -> HeadId {
        let id = HeadId(self.allocate_id());
        self.heads.push(Head::new(id));
        log::debug!("Head {:?} added", id);
        id
    }

    pub fn update_head(&mut self, id: HeadId, field: HeadField) {
        let Some(head) = self.heads.iter_mut().find(|head| head.id == id) else {
            log::debug!("Ignoring update for unknown head {:?}", id);
            return;
        };

        match field {
            HeadField::Name(name) => head.name = name,
            HeadField::Description(description) => head.description = description,
            HeadField::Make(make) => head.make = Some(make),
            HeadField::Model(model) => head.model = Some(model),
            HeadField::SerialNumber(serial) => head.serial_number = Some(serial),
            HeadField::PhysicalSize { width, height } => head.physical_size = (width, height),
            HeadField::Enabled(enabled) => {
                head.enabled = enabled;
                // A disabled head has no active mode
                if !enabled {
                    head.current_mode = None;
                }
            }
            HeadField::CurrentMode(mode) => {
                if head.mode(mode).is_some() {
                    head.current_mode = Some(mode);
                } else {
                    log::warn!("Head '{}' received unknown current mode", head.name);
                    head.current_mode = None;
                }
            }
            HeadField::Position { x, y } => head.position = Position { x, y },
            HeadField::Transform(transform) => head.transform = transform,
            HeadField::Scale(scale) => head.scale = scale,
            HeadField::AdaptiveSync(enabled) => head.adaptive_sync = Some(enabled),
        }
    }

    pub fn add_mode(&mut self, head_id: HeadId) -> Option<ModeId> {
        let id = ModeId(self.next_id);
        let head = self.heads.iter_mut().find(|head| head.id == head_id)?;
        self.next_id += 1;

        head.modes.push(Mode {
            id,
            width: 0,
            height: 0,
            refresh: 0,
            preferred: false,
        });
        self.mode_owners.insert(id, head_id);
        Some(id)
    }

    pub fn update_mode(&mut self, id: ModeId, field: ModeField) {
        let Some(mode) = self.mode_mut(id) else {
            log::debug!("Ignoring update for unknown mode {:?}", id);
            return;
        };

        match field {
            ModeField::Size { width, height } => {
                mode.width = width;
                mode.height = height;
            }
            ModeField::Refresh(refresh) => mode.refresh = refresh,
            ModeField::Preferred => mode.preferred = true,
        }
    }

    pub fn remove_mode(&mut self, id: ModeId) {
        let Some(head_id) = self.mode_owners.remove(&id) else {
            return;
        };
        if let Some(head) = self.heads.iter_mut().find(|head| head.id == head_id) {
            head.modes.retain(|mode| mode.id != id);
            if head.current_mode == Some(id) {
                head.current_mode = None;
            }
        }
    }

    pub fn remove_head(&mut self, id: HeadId) {
        let Some(index) = self.heads.iter().position(|head| head.id == id) else {
            return;
        };
        let head = self.heads.remove(index);
        for mode in &head.modes {
            self.mode_owners.remove(&mode.id);
        }
        log::debug!("Head '{}' removed", head.name);
    }

    pub fn head(&self, id: HeadId) -> Option<&Head> {
        self.heads.iter().find(|head| head.id == id)
    }

    /// Owner of a mode, if the mode is still alive
    pub fn mode_owner(&self, id: ModeId) -> Option<HeadId> {
        self.mode_owners.get(&id).copied()
    }

    pub fn heads(&self) -> &[Head] {
        &self.heads
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn snapshot(&self, serial: u32) -> Snapshot {
        Snapshot {
            serial,
            heads: self.heads.clone(),
        }
    }

    fn mode_mut(&mut self, id: ModeId) -> Option<&mut Mode> {
        let head_id = *self.mode_owners.get(&id)?;
        self.heads
            .iter_mut()
            .find(|head| head.id == head_id)?
            .modes
            .iter_mut()
            .find(|mode| mode.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
