//! Layout chromosome: one machine per identifier, each at a board position.

use serde::{Deserialize, Serialize};

use super::EvolutionError;
use crate::schema::{Connection, MachineId};

/// Position of a machine that has not been placed yet.
pub const UNPLACED: (i32, i32) = (-1, -1);

/// A machine at a board position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    id: MachineId,
    /// Column on the board.
    pub x: i32,
    /// Row on the board.
    pub y: i32,
}

impl Machine {
    /// Create a machine at a position.
    pub fn new(id: MachineId, x: i32, y: i32) -> Self {
        Self { id, x, y }
    }

    /// Machine identifier.
    #[inline]
    pub fn id(&self) -> MachineId {
        self.id
    }

    /// Current position.
    #[inline]
    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

/// A candidate assignment of machines to positions.
///
/// Machines are stored in gene order, which crossover works on and which
/// need not follow identifier order. `index[id]` holds the slot of machine
/// `id`. Every identifier in `0..=max_id` is present exactly once.
#[derive(Debug, Clone)]
pub struct Layout {
    machines: Vec<Machine>,
    index: Vec<usize>,
}

impl Layout {
    /// Create a layout with one unplaced machine per identifier in `0..=max_id`.
    pub fn generate(max_id: MachineId) -> Self {
        let machines = (0..=max_id)
            .map(|id| Machine::new(id, UNPLACED.0, UNPLACED.1))
            .collect();
        Self {
            machines,
            index: (0..=max_id).collect(),
        }
    }

    /// Build a layout from machines in gene order, checking that the
    /// identifiers form `0..=max_id` exactly once.
    pub fn from_machines(machines: Vec<Machine>, max_id: MachineId) -> Result<Self, EvolutionError> {
        if max_id >= machines.len() {
            // Fewer machines than identifiers: some identifier up to
            // `machines.len()` is absent.
            let mut present = vec![false; machines.len() + 1];
            for machine in &machines {
                if machine.id > max_id {
                    return Err(EvolutionError::UnknownMachineId(machine.id));
                }
                if let Some(flag) = present.get_mut(machine.id) {
                    *flag = true;
                }
            }
            let missing = present.iter().position(|&p| !p).unwrap_or(machines.len());
            return Err(EvolutionError::MissingMachineId(missing));
        }

        let mut index = vec![usize::MAX; max_id + 1];
        for (slot, machine) in machines.iter().enumerate() {
            let entry = index
                .get_mut(machine.id)
                .ok_or(EvolutionError::UnknownMachineId(machine.id))?;
            if *entry != usize::MAX {
                return Err(EvolutionError::DuplicateMachineId(machine.id));
            }
            *entry = slot;
        }
        if let Some(missing) = index.iter().position(|&slot| slot == usize::MAX) {
            return Err(EvolutionError::MissingMachineId(missing));
        }
        Ok(Self { machines, index })
    }

    /// Number of machines.
    #[inline]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Whether the layout holds no machines.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Highest machine identifier.
    #[inline]
    pub fn max_id(&self) -> MachineId {
        self.machines.len().saturating_sub(1)
    }

    /// Machines in gene order.
    #[inline]
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Machine at a gene slot.
    #[inline]
    pub fn slot(&self, slot: usize) -> Option<&Machine> {
        self.machines.get(slot)
    }

    /// Look up a machine by identifier.
    pub fn machine(&self, id: MachineId) -> Result<&Machine, EvolutionError> {
        self.index
            .get(id)
            .map(|&slot| &self.machines[slot])
            .ok_or(EvolutionError::UnknownMachineId(id))
    }

    /// Look up a machine by identifier for modification.
    pub fn machine_mut(&mut self, id: MachineId) -> Result<&mut Machine, EvolutionError> {
        let slot = *self
            .index
            .get(id)
            .ok_or(EvolutionError::UnknownMachineId(id))?;
        Ok(&mut self.machines[slot])
    }

    /// Position of a machine by identifier.
    #[inline]
    pub fn position(&self, id: MachineId) -> Result<(i32, i32), EvolutionError> {
        self.machine(id).map(Machine::position)
    }

    /// Move a machine to a new position.
    pub fn set_position(&mut self, id: MachineId, x: i32, y: i32) -> Result<(), EvolutionError> {
        let machine = self.machine_mut(id)?;
        machine.x = x;
        machine.y = y;
        Ok(())
    }

    /// Exchange the positions of two machines.
    pub fn swap_positions(&mut self, a: MachineId, b: MachineId) -> Result<(), EvolutionError> {
        let pa = self.position(a)?;
        let pb = self.position(b)?;
        self.set_position(a, pb.0, pb.1)?;
        self.set_position(b, pa.0, pa.1)
    }

    /// First machine other than `except` standing at a position.
    pub fn occupant(&self, x: i32, y: i32, except: MachineId) -> Option<MachineId> {
        self.machines
            .iter()
            .find(|m| m.id != except && m.x == x && m.y == y)
            .map(Machine::id)
    }

    /// Number of unordered machine pairs sharing a position.
    pub fn overlap_count(&self) -> u64 {
        let mut count = 0;
        for (i, a) in self.machines.iter().enumerate() {
            for b in &self.machines[i + 1..] {
                if a.x == b.x && a.y == b.y {
                    count += 1;
                }
            }
        }
        count
    }

    /// Total flow cost of the connections plus the overlap penalty.
    ///
    /// Lower is better.
    pub fn fitness(
        &self,
        connections: &[Connection],
        overlap_penalty: u64,
    ) -> Result<u64, EvolutionError> {
        let mut total = 0u64;
        for connection in connections {
            let source = self.position(connection.source)?;
            let target = self.position(connection.target)?;
            total = total.saturating_add(connection.cost_between(source, target));
        }
        Ok(total.saturating_add(overlap_penalty.saturating_mul(self.overlap_count())))
    }

    /// Serializable form of this layout, in identifier order.
    pub fn snapshot(&self) -> LayoutSnapshot {
        let mut snapshot = self.gene_snapshot();
        snapshot.machines.sort_by_key(|m| m.machine_id);
        snapshot
    }

    /// Serializable form of this layout, in gene order.
    pub fn gene_snapshot(&self) -> LayoutSnapshot {
        LayoutSnapshot {
            machines: self
                .machines
                .iter()
                .map(|m| MachineSnapshot {
                    machine_id: m.id,
                    pos_x: m.x,
                    pos_y: m.y,
                })
                .collect(),
        }
    }

    /// Rebuild a layout from its serialized form.
    ///
    /// Identifiers are dense, so one larger than the machine count is
    /// rejected before anything is sized from it.
    pub fn from_snapshot(snapshot: &LayoutSnapshot) -> Result<Self, EvolutionError> {
        let max_id = snapshot
            .machines
            .iter()
            .map(|m| m.machine_id)
            .max()
            .ok_or(EvolutionError::MissingMachineId(0))?;
        if max_id >= snapshot.machines.len() {
            return Err(EvolutionError::UnknownMachineId(max_id));
        }
        let machines = snapshot
            .machines
            .iter()
            .map(|m| Machine::new(m.machine_id, m.pos_x, m.pos_y))
            .collect();
        Self::from_machines(machines, max_id)
    }
}

/// Two layouts are equal when every machine stands at the same position in
/// both, regardless of gene order.
impl PartialEq for Layout {
    fn eq(&self, other: &Self) -> bool {
        self.machines.len() == other.machines.len()
            && self
                .machines
                .iter()
                .all(|m| other.position(m.id).is_ok_and(|p| p == m.position()))
    }
}

impl Eq for Layout {}

/// Serialized layout, as written to the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutSnapshot {
    pub machines: Vec<MachineSnapshot>,
}

/// Serialized machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MachineSnapshot {
    pub machine_id: MachineId,
    pub pos_x: i32,
    pub pos_y: i32,
}
