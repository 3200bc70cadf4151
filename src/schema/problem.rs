//! Problem model: machines, flow connections and board dimensions.
//!
//! A problem is loaded once per sweep and shared read-only between runs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identifier of a machine. Identifiers are dense: `0..=max_id`.
pub type MachineId = usize;

/// A directed material flow between two machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Machine the material leaves.
    pub source: MachineId,
    /// Machine the material arrives at.
    pub target: MachineId,
    /// Flow volume.
    pub amount: u64,
    /// Cost per unit of flow per unit of distance.
    pub cost: u64,
}

impl Connection {
    /// Cost of this connection for the given positions.
    #[inline]
    pub fn cost_between(&self, source: (i32, i32), target: (i32, i32)) -> u64 {
        let distance = source.0.abs_diff(target.0) as u64 + source.1.abs_diff(target.1) as u64;
        self.amount
            .saturating_mul(self.cost)
            .saturating_mul(distance)
    }
}

/// A flow record as it appears in the flow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub source: MachineId,
    pub dest: MachineId,
    pub amount: u64,
}

/// A cost record as it appears in the cost input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub source: MachineId,
    pub dest: MachineId,
    pub cost: u64,
}

/// Board dimensions. Valid positions are `[0, width) x [0, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub width: u32,
    pub height: u32,
}

impl Board {
    /// Number of cells on the board.
    #[inline]
    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether every cell is addressable with `i32` coordinates.
    pub fn is_valid(&self) -> bool {
        let limit = i32::MAX as u32;
        self.width > 0 && self.height > 0 && self.width <= limit && self.height <= limit
    }

    /// Check whether a position lies on the board.
    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}

impl Default for Board {
    fn default() -> Self {
        Self {
            width: 3,
            height: 3,
        }
    }
}

/// Where to read a problem from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemSource {
    /// JSON array of flow records.
    pub flow_path: PathBuf,
    /// JSON array of cost records.
    pub cost_path: PathBuf,
    /// Board the machines are placed on.
    #[serde(default)]
    pub board: Board,
}

impl Default for ProblemSource {
    fn default() -> Self {
        Self {
            flow_path: PathBuf::from("data/easy_flow.json"),
            cost_path: PathBuf::from("data/easy_cost.json"),
            board: Board::default(),
        }
    }
}

/// Immutable problem description.
#[derive(Debug, Clone)]
pub struct Problem {
    connections: Vec<Connection>,
    max_id: MachineId,
    board: Board,
}

impl Problem {
    /// Load a problem from flow and cost JSON files.
    pub fn load(source: &ProblemSource) -> Result<Self, ProblemError> {
        let flows: Vec<FlowRecord> = read_json(&source.flow_path)?;
        let costs: Vec<CostRecord> = read_json(&source.cost_path)?;
        Self::from_records(&flows, &costs, source.board)
    }

    /// Build a problem from in-memory records.
    ///
    /// Every flow record needs a cost record for the same `(source, dest)`
    /// pair; the first flow without one fails the whole load.
    pub fn from_records(
        flows: &[FlowRecord],
        costs: &[CostRecord],
        board: Board,
    ) -> Result<Self, ProblemError> {
        let cost_lookup: HashMap<(MachineId, MachineId), u64> = costs
            .iter()
            .map(|c| ((c.source, c.dest), c.cost))
            .collect();

        let connections = flows
            .iter()
            .map(|flow| {
                let cost = cost_lookup
                    .get(&(flow.source, flow.dest))
                    .copied()
                    .ok_or(ProblemError::MissingCostEntry {
                        source_id: flow.source,
                        target_id: flow.dest,
                    })?;
                Ok(Connection {
                    source: flow.source,
                    target: flow.dest,
                    amount: flow.amount,
                    cost,
                })
            })
            .collect::<Result<Vec<_>, ProblemError>>()?;

        Self::new(connections, board)
    }

    /// Build a problem directly from connections.
    pub fn new(connections: Vec<Connection>, board: Board) -> Result<Self, ProblemError> {
        if !board.is_valid() {
            return Err(ProblemError::InvalidBoard {
                width: board.width,
                height: board.height,
            });
        }

        let max_id = connections
            .iter()
            .map(|c| c.source.max(c.target))
            .max()
            .ok_or(ProblemError::NoConnections)?;

        if board.cells() < max_id + 1 {
            return Err(ProblemError::BoardTooSmall {
                cells: board.cells(),
                machines: max_id + 1,
            });
        }

        Ok(Self {
            connections,
            max_id,
            board,
        })
    }

    /// All connections.
    #[inline]
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Highest machine identifier; fixes the fleet size of every layout.
    #[inline]
    pub fn max_id(&self) -> MachineId {
        self.max_id
    }

    /// Number of machines in every layout.
    #[inline]
    pub fn machine_count(&self) -> usize {
        self.max_id + 1
    }

    /// Board dimensions.
    #[inline]
    pub fn board(&self) -> Board {
        self.board
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProblemError> {
    let content = fs::read_to_string(path).map_err(|source| ProblemError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ProblemError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Problem loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ProblemError {
    #[error("Failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("No cost entry for connection {source_id} -> {target_id}")]
    MissingCostEntry {
        source_id: MachineId,
        target_id: MachineId,
    },
    #[error("Problem has no connections")]
    NoConnections,
    #[error("Board {width}x{height} is invalid: dimensions must be between 1 and 2147483647")]
    InvalidBoard { width: u32, height: u32 },
    #[error("Board has {cells} cells but {machines} machines must be placed")]
    BoardTooSmall { cells: usize, machines: usize },
}
