//! Memory cells and reference-counted heap objects
//!
//! Every piece of storage the IR can name is a cell: stack slots, globals,
//! value buffers and the payload of each heap object. Addresses are a cell
//! plus a projection path into the cell's value; writes through a path
//! materialize the containers they pass through.
//!
//! Objects keep their slot after deallocation with `alive == false`, so
//! weak references can observe the death and stale strong references are
//! reported instead of silently reusing memory.

use super::error::{InterpResult, RuntimeError};
use super::value::{Addr, CellId, ObjectId, Proj, RtValue};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// Class instance; fields live in the object's cell
    Instance { class: String },
    /// `alloc_box` storage for a captured variable
    Box,
    /// Boxed error existential holding a value of `concrete`
    ErrorBox { concrete: String },
    /// Closure context; the cell holds the captured values as a tuple
    Context { on_stack: bool },
    /// Heap copy of block storage
    Block { invoke: String },
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Instance { class } => write!(f, "{class} instance"),
            ObjectKind::Box => write!(f, "box"),
            ObjectKind::ErrorBox { concrete } => write!(f, "error box ({concrete})"),
            ObjectKind::Context { on_stack: true } => write!(f, "on-stack closure context"),
            ObjectKind::Context { on_stack: false } => write!(f, "closure context"),
            ObjectKind::Block { invoke } => write!(f, "block ({invoke})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub kind: ObjectKind,
    pub strong: usize,
    pub pinned: bool,
    pub alive: bool,
    pub cell: CellId,
}

#[derive(Debug, Clone)]
struct Cell {
    value: RtValue,
    /// Nominal name used when a field projection initializes empty storage
    hint: Option<String>,
    live: bool,
}

/// Allocation and reference counting totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    pub objects_allocated: usize,
    pub objects_freed: usize,
    pub retains: usize,
    pub releases: usize,
    pub cells_allocated: usize,
    pub cells_freed: usize,
}

/// Storage still live after execution finished
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    /// Live objects not reachable from any global
    pub objects: Vec<String>,
    /// Stack cells and value buffers never deallocated
    pub cells: usize,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        self.objects.is_empty() && self.cells == 0
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "no leaks");
        }
        write!(f, "{} leaked objects, {} leaked cells", self.objects.len(), self.cells)?;
        for object in &self.objects {
            write!(f, "\n  {object}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Heap {
    cells: Vec<Cell>,
    objects: Vec<Object>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn alloc_cell(&mut self, value: RtValue, hint: Option<String>) -> CellId {
        self.stats.cells_allocated += 1;
        self.cells.push(Cell {
            value,
            hint,
            live: true,
        });
        CellId(self.cells.len() - 1)
    }

    /// Free a cell and hand back whatever it still holds
    pub fn free_cell(&mut self, id: CellId) -> InterpResult<RtValue> {
        let cell = self.cell_mut(id)?;
        cell.live = false;
        let value = std::mem::replace(&mut cell.value, RtValue::Uninit);
        self.stats.cells_freed += 1;
        Ok(value)
    }

    fn cell_mut(&mut self, id: CellId) -> InterpResult<&mut Cell> {
        match self.cells.get_mut(id.0) {
            Some(cell) if cell.live => Ok(cell),
            Some(_) => Err(RuntimeError::invalid_memory(format!("cell#{} was deallocated", id.0))),
            None => Err(RuntimeError::invalid_memory(format!("no cell#{}", id.0))),
        }
    }

    pub fn read(&self, addr: &Addr) -> InterpResult<RtValue> {
        let cell = match self.cells.get(addr.cell.0) {
            Some(cell) if cell.live => cell,
            _ => return Err(RuntimeError::invalid_memory(format!("{addr} is not live"))),
        };
        let mut current = &cell.value;
        for proj in &addr.path {
            current = match (proj, current) {
                (Proj::Field(i), RtValue::Struct { fields, .. }) => fields.get(*i),
                (Proj::Elem(i), RtValue::Tuple(elems)) => elems.get(*i),
                (Proj::Payload, RtValue::Enum { payload: Some(p), .. }) => Some(&**p),
                (Proj::Payload, RtValue::Existential { payload, .. }) => Some(&**payload),
                _ => None,
            }
            .ok_or_else(|| RuntimeError::invalid_memory(format!("{addr} does not name initialized storage")))?;
        }
        Ok(current.clone())
    }

    /// Location named by `addr`, creating intermediate containers
    fn location(&mut self, addr: &Addr) -> InterpResult<&mut RtValue> {
        let cell = self.cell_mut(addr.cell)?;
        let mut hint = cell.hint.clone();
        let mut slot = &mut cell.value;
        for proj in &addr.path {
            let current = slot;
            if matches!(current, RtValue::Uninit) {
                *current = match proj {
                    Proj::Field(_) => RtValue::Struct {
                        name: hint.clone().unwrap_or_default(),
                        fields: Vec::new(),
                    },
                    Proj::Elem(_) => RtValue::Tuple(Vec::new()),
                    Proj::Payload => RtValue::Enum {
                        owner: String::new(),
                        case: String::new(),
                        payload: None,
                    },
                };
            }
            hint = None;
            slot = match (proj, current) {
                (Proj::Field(i), RtValue::Struct { fields: elems, .. }) | (Proj::Elem(i), RtValue::Tuple(elems)) => {
                    if elems.len() <= *i {
                        elems.resize(*i + 1, RtValue::Uninit);
                    }
                    &mut elems[*i]
                }
                (Proj::Payload, RtValue::Enum { payload, .. }) => &mut **payload.get_or_insert_with(|| Box::new(RtValue::Uninit)),
                (Proj::Payload, RtValue::Existential { concrete, payload }) => {
                    hint = Some(concrete.clone());
                    &mut **payload
                }
                (_, other) => {
                    return Err(RuntimeError::invalid_memory(format!(
                        "{addr}: cannot project into {}",
                        other.type_name()
                    )))
                }
            };
        }
        Ok(slot)
    }

    /// Store `value` at `addr`, returning the previous contents
    pub fn write(&mut self, addr: &Addr, value: RtValue) -> InterpResult<RtValue> {
        let slot = self.location(addr)?;
        Ok(std::mem::replace(slot, value))
    }

    /// Move the value out of `addr`, leaving it uninitialized
    pub fn take(&mut self, addr: &Addr) -> InterpResult<RtValue> {
        let value = self.write(addr, RtValue::Uninit)?;
        if matches!(value, RtValue::Uninit) {
            return Err(RuntimeError::invalid_memory(format!("take from uninitialized {addr}")));
        }
        Ok(value)
    }

    /// Set the case of the enum stored at `addr`, keeping any payload
    pub fn inject_case(&mut self, addr: &Addr, owner: &str, case: &str) -> InterpResult<()> {
        let slot = self.location(addr)?;
        match slot {
            RtValue::Enum {
                owner: o, case: c, ..
            } => {
                *o = owner.to_string();
                *c = case.to_string();
            }
            RtValue::Uninit => {
                *slot = RtValue::Enum {
                    owner: owner.to_string(),
                    case: case.to_string(),
                    payload: None,
                }
            }
            other => {
                return Err(RuntimeError::invalid_memory(format!(
                    "{addr}: inject into {}",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    pub fn alloc_object(&mut self, kind: ObjectKind, contents: RtValue, hint: Option<String>) -> ObjectId {
        let cell = self.alloc_cell(contents, hint);
        self.stats.objects_allocated += 1;
        self.objects.push(Object {
            kind,
            strong: 1,
            pinned: false,
            alive: true,
            cell,
        });
        ObjectId(self.objects.len() - 1)
    }

    pub fn object(&self, id: ObjectId) -> InterpResult<&Object> {
        match self.objects.get(id.0) {
            Some(object) if object.alive => Ok(object),
            Some(object) => Err(RuntimeError::refcount(format!("{id} ({}) used after free", object.kind))),
            None => Err(RuntimeError::refcount(format!("no {id}"))),
        }
    }

    pub fn object_mut(&mut self, id: ObjectId) -> InterpResult<&mut Object> {
        match self.objects.get_mut(id.0) {
            Some(object) if object.alive => Ok(object),
            Some(_) => Err(RuntimeError::refcount(format!("{id} used after free"))),
            None => Err(RuntimeError::refcount(format!("no {id}"))),
        }
    }

    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.objects.get(id.0).is_some_and(|o| o.alive)
    }

    pub fn retain(&mut self, id: ObjectId) -> InterpResult<()> {
        self.object_mut(id)?.strong += 1;
        self.stats.retains += 1;
        Ok(())
    }

    /// Retain every strong reference held by `value`
    pub fn retain_value(&mut self, value: &RtValue) -> InterpResult<()> {
        let mut refs = Vec::new();
        value.strong_refs(&mut refs);
        refs.into_iter().try_for_each(|id| self.retain(id))
    }

    /// Release every strong reference held by `value`, freeing objects
    /// whose count drops to zero and releasing their contents in turn
    pub fn release_value(&mut self, value: RtValue) -> InterpResult<()> {
        let mut pending = Vec::new();
        value.strong_refs(&mut pending);
        while let Some(id) = pending.pop() {
            self.stats.releases += 1;
            let object = self.object_mut(id)?;
            object.strong = object
                .strong
                .checked_sub(1)
                .ok_or_else(|| RuntimeError::refcount(format!("{id} released below zero")))?;
            if object.strong > 0 {
                continue;
            }
            object.alive = false;
            let cell = object.cell;
            let borrowed_context = matches!(object.kind, ObjectKind::Context { on_stack: true });
            self.stats.objects_freed += 1;
            tracing::trace!(object = %id, "deallocated");
            let contents = self.free_cell(cell)?;
            if !borrowed_context {
                contents.strong_refs(&mut pending);
            }
        }
        Ok(())
    }

    /// Leak check: live objects unreachable from `roots`, plus live cells
    /// that are neither roots nor object storage
    pub fn leak_report(&self, roots: &[CellId]) -> LeakReport {
        let mut reachable = HashSet::new();
        let mut pending: Vec<ObjectId> = Vec::new();
        for root in roots {
            if let Some(cell) = self.cells.get(root.0).filter(|c| c.live) {
                cell.value.strong_refs(&mut pending);
            }
        }
        while let Some(id) = pending.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(cell) = self.objects.get(id.0).and_then(|o| self.cells.get(o.cell.0)).filter(|c| c.live) {
                cell.value.strong_refs(&mut pending);
            }
        }

        let objects = self
            .objects
            .iter()
            .enumerate()
            .filter(|(i, o)| o.alive && !reachable.contains(&ObjectId(*i)))
            .map(|(i, o)| format!("{} ({}, strong {})", ObjectId(i), o.kind, o.strong))
            .collect();
        let owned: HashSet<CellId> = self.objects.iter().filter(|o| o.alive).map(|o| o.cell).collect();
        let cells = self
            .cells
            .iter()
            .enumerate()
            .filter(|(i, c)| c.live && !roots.contains(&CellId(*i)) && !owned.contains(&CellId(*i)))
            .count();
        LeakReport { objects, cells }
    }
}
