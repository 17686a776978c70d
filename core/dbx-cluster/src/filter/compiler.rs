//! Scan Filter Compiler — 2-pass 필터 프로그램 컴파일러
//!
//! Pass 1 ([`FilterSpec::analyze`]) runs once per predicate tree: it resolves
//! columns, assigns every operand a slot in a parameter buffer, and, when the
//! tree holds only literals, builds the program right away.
//!
//! Pass 2 ([`FilterSpec::program`]) runs per execution: it encodes operands
//! into a fresh buffer following the cached layout and emits the instruction
//! stream. A constant tree skips pass 2 and reuses its program.
//!
//! ```text
//! NOT (a = ? OR b BETWEEN 1 AND 5)
//!   Begin(Nand)
//!     Begin(Or)
//!       Compare(Eq, a, @0)
//!       Begin(And)  Compare(Ge, b, @4)  Compare(Le, b, @8)  End
//!     End
//!   End
//! ```

use super::{Comparator, Operand, Params, Predicate};
use crate::error::{DbxError, DbxResult, SqlState};
use crate::schema::encoding::{decode_from, encode_into};
use crate::schema::{ColumnMetadata, Row, TableMetadata, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind of an instruction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    And,
    Or,
    /// Negated AND; a one-child NAND is NOT
    Nand,
    Nor,
}

/// One filter instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Begin(GroupKind),
    End,
    /// Compare `column` against the operand encoded at `offset..offset + width`
    Compare {
        cond: Comparator,
        column: usize,
        offset: usize,
        width: usize,
    },
    IsNull {
        column: usize,
    },
    IsNotNull {
        column: usize,
    },
}

/// Encoded filter: instructions plus the operand buffer they reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterProgram {
    instructions: Vec<Instruction>,
    buffer: Vec<u8>,
}

impl FilterProgram {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Evaluate against one row of `table`.
    ///
    /// Three-valued: a comparison against a null column value is unknown,
    /// negating unknown stays unknown, and the row matches only on true.
    pub fn evaluate(&self, table: &TableMetadata, row: &Row) -> DbxResult<bool> {
        let mut pos = 0;
        let result = self.eval_at(table, row, &mut pos)?;
        if pos != self.instructions.len() {
            return Err(DbxError::Serialization(format!(
                "filter program has {} trailing instructions",
                self.instructions.len() - pos
            )));
        }
        Ok(result == Some(true))
    }

    /// `None` is SQL unknown.
    fn eval_at(
        &self,
        table: &TableMetadata,
        row: &Row,
        pos: &mut usize,
    ) -> DbxResult<Option<bool>> {
        let instruction = self.instructions.get(*pos).ok_or_else(|| {
            DbxError::Serialization("filter program ended inside a group".to_string())
        })?;
        *pos += 1;

        match instruction {
            Instruction::Begin(kind) => {
                let mut results = Vec::new();
                loop {
                    match self.instructions.get(*pos) {
                        Some(Instruction::End) => {
                            *pos += 1;
                            break;
                        }
                        Some(_) => results.push(self.eval_at(table, row, pos)?),
                        None => {
                            return Err(DbxError::Serialization(
                                "unterminated filter group".to_string(),
                            ));
                        }
                    }
                }
                Ok(match kind {
                    GroupKind::And => all(&results),
                    GroupKind::Or => any(&results),
                    GroupKind::Nand => all(&results).map(|r| !r),
                    GroupKind::Nor => any(&results).map(|r| !r),
                })
            }
            Instruction::End => Err(DbxError::Serialization(
                "unbalanced End in filter program".to_string(),
            )),
            Instruction::Compare {
                cond,
                column,
                offset,
                width,
            } => {
                let Some(value) = row.get(*column).filter(|v| !v.is_null()) else {
                    return Ok(None);
                };
                let meta = column_meta(table, *column)?;
                let bytes = self.buffer.get(*offset..offset + width).ok_or_else(|| {
                    DbxError::Serialization(format!("operand at {offset} outside buffer"))
                })?;
                let operand = decode_operand(meta, bytes)?;
                Ok(value.compare(&operand).map(|ord| cond.matches(ord)))
            }
            Instruction::IsNull { column } => {
                Ok(Some(row.get(*column).is_none_or(Value::is_null)))
            }
            Instruction::IsNotNull { column } => {
                Ok(Some(row.get(*column).is_some_and(|v| !v.is_null())))
            }
        }
    }
}

/// Kleene AND: false wins over unknown.
fn all(results: &[Option<bool>]) -> Option<bool> {
    if results.contains(&Some(false)) {
        Some(false)
    } else if results.contains(&None) {
        None
    } else {
        Some(true)
    }
}

/// Kleene OR: true wins over unknown.
fn any(results: &[Option<bool>]) -> Option<bool> {
    if results.contains(&Some(true)) {
        Some(true)
    } else if results.contains(&None) {
        None
    } else {
        Some(false)
    }
}

fn column_meta(table: &TableMetadata, column: usize) -> DbxResult<&ColumnMetadata> {
    table.columns.get(column).ok_or_else(|| {
        DbxError::Serialization(format!("filter references column {column} of '{}'", table.name))
    })
}

fn decode_operand(meta: &ColumnMetadata, bytes: &[u8]) -> DbxResult<Value> {
    let value = decode_from(meta, bytes)?;
    match &meta.converter {
        Some(converter) => converter.from_db(value),
        None => Ok(value),
    }
}

fn encode_operand(meta: &ColumnMetadata, value: &Value, out: &mut [u8]) -> DbxResult<()> {
    if value.is_null() {
        return Err(DbxError::encoder(
            &meta.name,
            "null operand in comparison; use IS NULL",
            SqlState::NULL_NOT_ALLOWED,
        ));
    }
    match &meta.converter {
        Some(converter) => {
            let converted = converter.to_db(value).map_err(|e| {
                DbxError::encoder(&meta.name, e.to_string(), SqlState::DATA_EXCEPTION)
            })?;
            encode_into(meta, &converted, out)
        }
        None => encode_into(meta, value, out),
    }
}

// ════════════════════════════════════════════
// Pass 1: layout
// ════════════════════════════════════════════

/// Operand position in the parameter buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct OperandSlot {
    pub operand: Operand,
    pub column: usize,
    pub offset: usize,
    pub width: usize,
}

/// Predicate node annotated with its server opcode.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Group(GroupKind, Vec<Node>),
    Compare {
        cond: Comparator,
        slot: usize,
    },
    Between {
        low: usize,
        high: usize,
    },
    Null {
        column: usize,
        negated: bool,
    },
}

/// Cached result of the layout pass.
#[derive(Debug)]
pub struct FilterSpec {
    table: String,
    root: Node,
    slots: Vec<OperandSlot>,
    buffer_size: usize,
    constant: Option<Arc<FilterProgram>>,
    builds: AtomicUsize,
}

impl FilterSpec {
    /// Pass 1 over `root` for rows of `table`.
    pub fn analyze(root: &Predicate, table: &TableMetadata) -> DbxResult<Self> {
        let mut slots = Vec::new();
        let mut buffer_size = 0;
        let node = annotate(root, table, &mut slots, &mut buffer_size)?;

        let mut spec = Self {
            table: table.qualified_name(),
            root: node,
            slots,
            buffer_size,
            constant: None,
            builds: AtomicUsize::new(0),
        };
        if root.is_constant() {
            spec.constant = Some(Arc::new(spec.build(table, &Params::new())?));
        }
        Ok(spec)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn slots(&self) -> &[OperandSlot] {
        &self.slots
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    /// Number of times pass 2 has run.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Program for one execution; the constant program when there is one.
    pub fn program(&self, table: &TableMetadata, params: &Params) -> DbxResult<Arc<FilterProgram>> {
        match &self.constant {
            Some(program) => Ok(Arc::clone(program)),
            None => Ok(Arc::new(self.build(table, params)?)),
        }
    }

    // ════════════════════════════════════════════
    // Pass 2: build
    // ════════════════════════════════════════════

    fn build(&self, table: &TableMetadata, params: &Params) -> DbxResult<FilterProgram> {
        self.builds.fetch_add(1, Ordering::Relaxed);

        let mut buffer = vec![0u8; self.buffer_size];
        let mut errors = Vec::new();
        for slot in &self.slots {
            let value = match &slot.operand {
                Operand::Literal(v) => v,
                Operand::Param(name) => params.require(name)?,
            };
            let meta = column_meta(table, slot.column)?;
            let out = &mut buffer[slot.offset..slot.offset + slot.width];
            if let Err(err) = encode_operand(meta, value, out) {
                errors.push(err);
            }
        }
        if let Some(err) = DbxError::merge_encoder_errors(errors) {
            return Err(err);
        }

        let mut instructions = Vec::new();
        emit(&self.root, &self.slots, &mut instructions);
        Ok(FilterProgram {
            instructions,
            buffer,
        })
    }
}

fn annotate(
    predicate: &Predicate,
    table: &TableMetadata,
    slots: &mut Vec<OperandSlot>,
    offset: &mut usize,
) -> DbxResult<Node> {
    Ok(match predicate {
        Predicate::Compare {
            column,
            op,
            operand,
        } => {
            let column = table.require_column(column)?;
            Node::Compare {
                cond: *op,
                slot: push_slot(table, slots, offset, operand, column),
            }
        }
        Predicate::Between { column, low, high } => {
            let column = table.require_column(column)?;
            let low = push_slot(table, slots, offset, low, column);
            let high = push_slot(table, slots, offset, high, column);
            Node::Between { low, high }
        }
        Predicate::IsNull(column) => Node::Null {
            column: table.require_column(column)?,
            negated: false,
        },
        Predicate::IsNotNull(column) => Node::Null {
            column: table.require_column(column)?,
            negated: true,
        },
        Predicate::And(children) => Node::Group(
            GroupKind::And,
            children
                .iter()
                .map(|c| annotate(c, table, slots, offset))
                .collect::<DbxResult<_>>()?,
        ),
        Predicate::Or(children) => Node::Group(
            GroupKind::Or,
            children
                .iter()
                .map(|c| annotate(c, table, slots, offset))
                .collect::<DbxResult<_>>()?,
        ),
        Predicate::Not(child) => Node::Group(
            GroupKind::Nand,
            vec![annotate(child, table, slots, offset)?],
        ),
    })
}

fn push_slot(
    table: &TableMetadata,
    slots: &mut Vec<OperandSlot>,
    offset: &mut usize,
    operand: &Operand,
    column: usize,
) -> usize {
    let width = table.columns[column].column_type.encoded_width();
    slots.push(OperandSlot {
        operand: operand.clone(),
        column,
        offset: *offset,
        width,
    });
    *offset += width;
    slots.len() - 1
}

fn emit(node: &Node, slots: &[OperandSlot], out: &mut Vec<Instruction>) {
    let compare = |cond: Comparator, slot: usize| {
        let slot = &slots[slot];
        Instruction::Compare {
            cond,
            column: slot.column,
            offset: slot.offset,
            width: slot.width,
        }
    };

    match node {
        Node::Group(kind, children) => {
            out.push(Instruction::Begin(*kind));
            for child in children {
                emit(child, slots, out);
            }
            out.push(Instruction::End);
        }
        Node::Compare { cond, slot } => out.push(compare(*cond, *slot)),
        Node::Between { low, high } => {
            out.push(Instruction::Begin(GroupKind::And));
            out.push(compare(Comparator::Ge, *low));
            out.push(compare(Comparator::Le, *high));
            out.push(Instruction::End);
        }
        Node::Null { column, negated } => out.push(if *negated {
            Instruction::IsNotNull { column: *column }
        } else {
            Instruction::IsNull { column: *column }
        }),
    }
}
