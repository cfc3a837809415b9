//! Filter operator with simple predicate evaluation.
//!
//! Supports expressions of the form "col OP literal" or "col % N OP literal"
//! where OP ∈ {==, !=, <, <=, >, >=}.

use strata_core::types::{Column, RowBatch, Scalar};

use crate::traits::{OpError, Operator, OperatorCtx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    column: String,
    modulus: Option<i64>,
    op: CmpOp,
    literal: String,
}

pub struct FilterOperator {
    ctx: OperatorCtx,
    predicate: Predicate,
    pending: Option<RowBatch>,
    no_more_input: bool,
}

impl FilterOperator {
    /// Fails with a planning error if `expr` cannot be parsed.
    pub fn new(ctx: OperatorCtx, expr: &str) -> Result<Self, OpError> {
        Ok(Self {
            ctx,
            predicate: parse_simple_predicate(expr)?,
            pending: None,
            no_more_input: false,
        })
    }

    fn filter(&self, input: &RowBatch) -> Result<RowBatch, OpError> {
        let col = input.column(&self.predicate.column).ok_or_else(|| {
            OpError::Exec(format!("column '{}' not found", self.predicate.column))
        })?;

        let mut keep = Vec::with_capacity(col.values.len());
        for val in &col.values {
            keep.push(eval_predicate(val, &self.predicate)?);
        }

        let columns = input
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                values: c
                    .values
                    .iter()
                    .zip(&keep)
                    .filter(|(_, k)| **k)
                    .map(|(v, _)| v.clone())
                    .collect(),
            })
            .collect();
        Ok(RowBatch { columns })
    }
}

impl Operator for FilterOperator {
    fn ctx(&self) -> &OperatorCtx {
        &self.ctx
    }

    fn needs_input(&self) -> bool {
        !self.no_more_input && self.pending.is_none()
    }

    fn add_input(&mut self, batch: RowBatch) -> Result<(), OpError> {
        let filtered = self.filter(&batch)?;
        if filtered.num_rows() > 0 {
            self.pending = Some(filtered);
        }
        Ok(())
    }

    fn no_more_input(&mut self) -> Result<(), OpError> {
        self.no_more_input = true;
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RowBatch>, OpError> {
        Ok(self.pending.take())
    }

    fn is_finished(&self) -> bool {
        self.no_more_input && self.pending.is_none()
    }
}

/// Parse a simple predicate like "age > 18", "name == Alice" or "m1 % 10 == 0".
fn parse_simple_predicate(expr: &str) -> Result<Predicate, OpError> {
    let ops = [
        ("==", CmpOp::Eq),
        ("!=", CmpOp::Ne),
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ];

    for (token, op) in ops {
        if let Some(pos) = expr.find(token) {
            let lhs = expr[..pos].trim();
            let literal = expr[pos + token.len()..].trim().to_string();
            let (column, modulus) = match lhs.split_once('%') {
                Some((col, m)) => {
                    let m = m.trim().parse::<i64>().map_err(|_| {
                        OpError::Plan(format!("cannot parse modulus in predicate: {expr}"))
                    })?;
                    if m == 0 {
                        return Err(OpError::Plan(format!("modulus by zero in predicate: {expr}")));
                    }
                    (col.trim().to_string(), Some(m))
                }
                None => (lhs.to_string(), None),
            };
            if column.is_empty() || literal.is_empty() {
                break;
            }
            return Ok(Predicate {
                column,
                modulus,
                op,
                literal,
            });
        }
    }

    Err(OpError::Plan(format!("unparseable predicate: {expr}")))
}

/// Evaluate a simple comparison predicate
fn eval_predicate(val: &Scalar, pred: &Predicate) -> Result<bool, OpError> {
    use Scalar::*;

    let op = pred.op;
    let literal = pred.literal.as_str();

    if let Some(m) = pred.modulus {
        let Some(v) = val.as_i64() else {
            return match val {
                Null => Ok(false),
                _ => Err(OpError::Exec(format!(
                    "modulus needs an integer column, got {:?}",
                    val.data_type()
                ))),
            };
        };
        let lit = literal
            .parse::<i64>()
            .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as i64")))?;
        return Ok(op.apply(&(v % m), &lit));
    }

    match val {
        Null => Ok(false), // Null comparisons are false
        Bool(b) => {
            let lit_bool = literal
                .parse::<bool>()
                .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as bool")))?;
            match op {
                CmpOp::Eq | CmpOp::Ne => Ok(op.apply(b, &lit_bool)),
                _ => Err(OpError::Exec(format!("unsupported op {op:?} for bool"))),
            }
        }
        I32(i) => {
            let lit = literal
                .parse::<i32>()
                .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as i32")))?;
            Ok(op.apply(i, &lit))
        }
        I64(i) => {
            let lit = literal
                .parse::<i64>()
                .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as i64")))?;
            Ok(op.apply(i, &lit))
        }
        F32(f) => {
            let lit = literal
                .parse::<f32>()
                .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as f32")))?;
            Ok(match op {
                CmpOp::Eq => (*f - lit).abs() < f32::EPSILON,
                CmpOp::Ne => (*f - lit).abs() >= f32::EPSILON,
                _ => op.apply(f, &lit),
            })
        }
        F64(f) => {
            let lit = literal
                .parse::<f64>()
                .map_err(|_| OpError::Exec(format!("cannot parse '{literal}' as f64")))?;
            Ok(match op {
                CmpOp::Eq => (*f - lit).abs() < f64::EPSILON,
                CmpOp::Ne => (*f - lit).abs() >= f64::EPSILON,
                _ => op.apply(f, &lit),
            })
        }
        Str(s) => Ok(op.apply(&s.as_str(), &literal)),
        Bin(_) => Err(OpError::Exec("cannot filter on binary data".into())),
    }
}
