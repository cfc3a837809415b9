//! Lightweight value/column containers for batches flowing between operators.
//!
//! Columns are `Vec<Scalar>`; the engine core cares about scheduling and
//! spilling, not vectorized kernels.

use serde::{Deserialize, Serialize};

use crate::schema::{DataType, Field, Schema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bin(Vec<u8>),
}

impl Scalar {
    pub fn data_type(&self) -> DataType {
        match self {
            Scalar::Null => DataType::Null,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::I32(_) => DataType::Int32,
            Scalar::I64(_) => DataType::Int64,
            Scalar::F32(_) => DataType::Float32,
            Scalar::F64(_) => DataType::Float64,
            Scalar::Str(_) => DataType::Utf8,
            Scalar::Bin(_) => DataType::Binary,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::I32(v) => Some(*v as i64),
            Scalar::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Rough in-memory footprint, used for memory accounting and spill buffers.
    pub fn estimated_bytes(&self) -> usize {
        let heap = match self {
            Scalar::Str(s) => s.len(),
            Scalar::Bin(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Scalar>() + heap
    }

    /// Append a type-tagged, self-delimiting encoding of this value to `out`.
    ///
    /// Two scalars encode to the same bytes iff they are equal (floats compare
    /// by bit pattern), so the encoding can be used as a hash-table key.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(scalar_type_order(self));
        match self {
            Scalar::Null => {}
            Scalar::Bool(b) => out.push(*b as u8),
            Scalar::I32(i) => out.extend_from_slice(&i.to_le_bytes()),
            Scalar::I64(i) => out.extend_from_slice(&i.to_le_bytes()),
            Scalar::F32(f) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
            Scalar::F64(f) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
            Scalar::Str(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Scalar::Bin(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Scalar>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Scalar>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<Column>,
}

impl RowBatch {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Schema derived from the column names and the type of the first value.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| {
                    let dt = c
                        .values
                        .iter()
                        .find(|v| !matches!(v, Scalar::Null))
                        .map(Scalar::data_type)
                        .unwrap_or(DataType::Null);
                    Field::new(c.name.clone(), dt)
                })
                .collect(),
        )
    }

    /// Resolve column names to indices.
    pub fn key_indices(&self, keys: &[String]) -> Result<Vec<usize>, String> {
        keys.iter()
            .map(|key| {
                self.column_index(key)
                    .ok_or_else(|| format!("key column '{}' not found", key))
            })
            .collect()
    }

    /// Build a new batch from the selected rows, in the given order.
    pub fn select(&self, rows: &[usize]) -> RowBatch {
        RowBatch {
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    values: rows.iter().map(|&r| c.values[r].clone()).collect(),
                })
                .collect(),
        }
    }

    pub fn estimated_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.name.len() + c.values.iter().map(Scalar::estimated_bytes).sum::<usize>())
            .sum()
    }

    /// Encode the key columns of one row; see [`Scalar::encode_into`].
    pub fn encode_key(&self, row: usize, key_indices: &[usize], out: &mut Vec<u8>) {
        for &col in key_indices {
            self.columns[col].values[row].encode_into(out);
        }
    }

    /// Clone the key values of one row.
    pub fn key_values(&self, row: usize, key_indices: &[usize]) -> Vec<Scalar> {
        key_indices
            .iter()
            .map(|&col| self.columns[col].values[row].clone())
            .collect()
    }

    /// 64-bit hash of the key columns for every row.
    ///
    /// The hash depends only on the key values and their order, so a batch
    /// carrying the keys in columns `[0..n)` hashes the same as the original
    /// input batch hashed on its key columns.
    pub fn hash_rows(&self, key_indices: &[usize]) -> Vec<u64> {
        let num_rows = self.num_rows();
        let mut result = Vec::with_capacity(num_rows);
        let mut key = Vec::new();
        for row in 0..num_rows {
            key.clear();
            self.encode_key(row, key_indices, &mut key);
            result.push(hash_key_bytes(&key));
        }
        result
    }
}

/// Hash an encoded key (see [`RowBatch::encode_key`]) to 64 bits.
pub fn hash_key_bytes(key: &[u8]) -> u64 {
    let hash = blake3::hash(key);
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(word)
}

/// Assign a numeric order to scalar types, used as the encoding tag.
fn scalar_type_order(s: &Scalar) -> u8 {
    use Scalar::*;
    match s {
        Null => 0,
        Bool(_) => 1,
        I32(_) => 2,
        I64(_) => 3,
        F32(_) => 4,
        F64(_) => 5,
        Str(_) => 6,
        Bin(_) => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> RowBatch {
        RowBatch::new(vec![
            Column::new("k", vec![Scalar::I64(1), Scalar::I64(2), Scalar::I64(1)]),
            Column::new(
                "v",
                vec![
                    Scalar::Str("a".into()),
                    Scalar::Str("b".into()),
                    Scalar::Str("c".into()),
                ],
            ),
        ])
    }

    #[test]
    fn equal_keys_hash_equal() {
        let b = batch();
        let hashes = b.hash_rows(&[0]);
        assert_eq!(hashes[0], hashes[2]);
        assert_ne!(hashes[0], hashes[1]);
    }

    #[test]
    fn key_batch_hashes_like_source() {
        let b = batch();
        let keys_only = RowBatch::new(vec![b.columns[0].clone()]);
        assert_eq!(b.hash_rows(&[0]), keys_only.hash_rows(&[0]));
    }

    #[test]
    fn select_keeps_order() {
        let b = batch().select(&[2, 0]);
        assert_eq!(b.num_rows(), 2);
        assert_eq!(b.columns[1].values[0], Scalar::Str("c".into()));
        assert_eq!(b.columns[1].values[1], Scalar::Str("a".into()));
    }

    #[test]
    fn string_encoding_is_self_delimiting() {
        let mut a = Vec::new();
        Scalar::Str("ab".into()).encode_into(&mut a);
        Scalar::Str("c".into()).encode_into(&mut a);
        let mut b = Vec::new();
        Scalar::Str("a".into()).encode_into(&mut b);
        Scalar::Str("bc".into()).encode_into(&mut b);
        assert_ne!(a, b);
    }
}
