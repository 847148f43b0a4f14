//! Sequence positions and the common-prefix matcher.

use std::fmt;
use std::sync::Arc;

/// Handle to embedding data produced upstream (e.g. an image patch).
///
/// Equality is identity: two handles are equal only if they point at the
/// same allocation. Identical embeddings are produced once and then shared
/// by reference, so comparing contents would only cost time.
#[derive(Clone)]
pub struct Embedding {
    data: Arc<[f32]>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            data: Arc::from(values),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for Embedding {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Embedding {}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Embedding({:p}, len={})", Arc::as_ptr(&self.data), self.data.len())
    }
}

/// One position of a sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Token(i32),
    Image(Embedding),
}

impl From<i32> for Input {
    fn from(token: i32) -> Self {
        Input::Token(token)
    }
}

impl From<Embedding> for Input {
    fn from(embedding: Embedding) -> Self {
        Input::Image(embedding)
    }
}

/// Build a token sequence, mostly for tests and workload generation.
pub fn tokens(ids: &[i32]) -> Vec<Input> {
    ids.iter().copied().map(Input::Token).collect()
}

/// Length of the shared leading run of `a` and `b`.
///
/// Stops at the first mismatch, so the cost is proportional to the match
/// length rather than to either sequence.
pub fn count_common_prefix(a: &[Input], b: &[Input]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
