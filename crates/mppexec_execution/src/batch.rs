use bytes::Bytes;

/// An immutable chunk of encoded columnar data moved between fragment
/// instances.
///
/// The encoding is owned by the storage/serialization layer, the execution
/// core only cares about the payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBatch {
    payload: Bytes,
    num_rows: usize,
}

impl RowBatch {
    pub fn new(payload: impl Into<Bytes>, num_rows: usize) -> Self {
        RowBatch {
            payload: payload.into(),
            num_rows,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of bytes this batch keeps alive.
    ///
    /// This is the value reserved from the memory pool while the batch is
    /// buffered by an exchange.
    pub fn retained_size(&self) -> u64 {
        self.payload.len() as u64
    }
}
