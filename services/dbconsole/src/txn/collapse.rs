//! Collapse rewrite of a staged log.
//!
//! Turns the append-only log into the minimal statement list that still
//! preserves "last write wins per cell":
//! - repeated edits of one cell become one assignment carrying the earliest
//!   `old_value` and the latest `new_value`; an edit back to the original
//!   value disappears,
//! - a delete supersedes earlier updates of the row,
//! - edits of a staged insert fold into the INSERT,
//! - an insert followed by a delete of the same synthetic row is dropped.
//!
//! Each row keeps the position of its first entry, so statements replay in
//! staging order. Every output carries the sequence numbers it came from.
use crate::backend::CellValue;
use crate::error::{ConsoleError, ConsoleResult};
use crate::txn::{RowKey, StagedChange, StagedOp};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    pub column: String,
    pub old_value: CellValue,
    pub new_value: CellValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Collapsed {
    Insert {
        row: RowKey,
        values: Vec<(String, CellValue)>,
        seqs: Vec<u64>,
    },
    Update {
        row: RowKey,
        cells: Vec<CellChange>,
        seqs: Vec<u64>,
    },
    Delete {
        row: RowKey,
        seqs: Vec<u64>,
    },
}

impl Collapsed {
    pub fn seqs(&self) -> &[u64] {
        match self {
            Collapsed::Insert { seqs, .. }
            | Collapsed::Update { seqs, .. }
            | Collapsed::Delete { seqs, .. } => seqs,
        }
    }
}

#[derive(Debug)]
enum Effect {
    Insert(Vec<(String, CellValue)>),
    Update(Vec<CellChange>),
    Delete,
    /// Inserted then deleted.
    Nothing,
}

#[derive(Debug)]
struct Slot {
    row: RowKey,
    effect: Effect,
    seqs: Vec<u64>,
}

pub fn collapse<'a>(
    ops: impl IntoIterator<Item = &'a StagedOp>,
) -> ConsoleResult<Vec<Collapsed>> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut by_row: HashMap<String, usize> = HashMap::new();

    for op in ops {
        let identity = op.change.row().identity();
        match &op.change {
            StagedChange::InsertRow { row, values } => {
                if by_row.contains_key(&identity) {
                    return Err(ConsoleError::validation(format!(
                        "row {row} is already staged"
                    )));
                }
                by_row.insert(identity, slots.len());
                slots.push(Slot {
                    row: row.clone(),
                    effect: Effect::Insert(
                        values
                            .iter()
                            .map(|(column, value)| (column.clone(), value.clone()))
                            .collect(),
                    ),
                    seqs: vec![op.seq],
                });
            }
            StagedChange::UpdateCell {
                row,
                column,
                old_value,
                new_value,
            } => {
                let slot = slot_for(&mut slots, &mut by_row, identity, row, || {
                    Effect::Update(Vec::new())
                })?;
                match &mut slot.effect {
                    Effect::Insert(values) => {
                        match values.iter_mut().find(|(name, _)| name == column) {
                            Some((_, value)) => *value = new_value.clone(),
                            None => values.push((column.clone(), new_value.clone())),
                        }
                    }
                    Effect::Update(cells) => {
                        match cells.iter_mut().find(|cell| &cell.column == column) {
                            Some(cell) => cell.new_value = new_value.clone(),
                            None => cells.push(CellChange {
                                column: column.clone(),
                                old_value: old_value.clone(),
                                new_value: new_value.clone(),
                            }),
                        }
                    }
                    Effect::Delete | Effect::Nothing => {
                        return Err(ConsoleError::validation(format!(
                            "row {row} is already staged for deletion"
                        )));
                    }
                }
                slot.seqs.push(op.seq);
            }
            StagedChange::DeleteRow { row } => {
                let slot =
                    slot_for(&mut slots, &mut by_row, identity, row, || Effect::Delete)?;
                slot.effect = match &slot.effect {
                    Effect::Insert(_) => Effect::Nothing,
                    Effect::Update(_) => Effect::Delete,
                    // Slot created by this very delete.
                    Effect::Delete if slot.seqs.is_empty() => Effect::Delete,
                    Effect::Delete | Effect::Nothing => {
                        return Err(ConsoleError::validation(format!(
                            "row {row} is already staged for deletion"
                        )));
                    }
                };
                slot.seqs.push(op.seq);
            }
        }
    }

    Ok(slots
        .into_iter()
        .filter_map(|slot| match slot.effect {
            Effect::Insert(values) => Some(Collapsed::Insert {
                row: slot.row,
                values,
                seqs: slot.seqs,
            }),
            Effect::Update(cells) => {
                let cells: Vec<CellChange> = cells
                    .into_iter()
                    .filter(|cell| cell.old_value != cell.new_value)
                    .collect();
                (!cells.is_empty()).then_some(Collapsed::Update {
                    row: slot.row,
                    cells,
                    seqs: slot.seqs,
                })
            }
            Effect::Delete => Some(Collapsed::Delete {
                row: slot.row,
                seqs: slot.seqs,
            }),
            Effect::Nothing => None,
        })
        .collect())
}

/// Existing slot for the row, or a new one. Synthetic keys must refer to an
/// insert staged earlier in the same log.
fn slot_for<'a>(
    slots: &'a mut Vec<Slot>,
    by_row: &mut HashMap<String, usize>,
    identity: String,
    row: &RowKey,
    fresh: impl FnOnce() -> Effect,
) -> ConsoleResult<&'a mut Slot> {
    let index = match by_row.get(&identity) {
        Some(index) => *index,
        None => {
            if row.is_staged() {
                return Err(ConsoleError::validation(format!(
                    "row {row} was not inserted in this transaction"
                )));
            }
            by_row.insert(identity, slots.len());
            slots.push(Slot {
                row: row.clone(),
                effect: fresh(),
                seqs: Vec::new(),
            });
            slots.len() - 1
        }
    };
    Ok(&mut slots[index])
}
