//! Run-every-step harness for cleanup sequences.
//!
//! Each step's result is recorded and the sequence keeps going; once every step
//! has run, the first failure is reported with the later ones attached.

use super::DatabaseError;

#[derive(Debug, Default)]
pub(crate) struct Failures {
    errors: Vec<DatabaseError>,
}

impl Failures {
    /// Records a step's outcome, returning its value on success.
    pub(crate) fn record<T>(&mut self, result: Result<T, DatabaseError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.push(error);
                None
            }
        }
    }

    // Nested collections are flattened so ordering stays chronological.
    pub(crate) fn push(&mut self, error: DatabaseError) {
        match error {
            DatabaseError::Multiple { first, suppressed } => {
                self.push(*first);
                for error in suppressed {
                    self.push(error);
                }
            }
            error => self.errors.push(error),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn into_result(self) -> Result<(), DatabaseError> {
        let mut errors = self.errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let suppressed: Vec<_> = errors.collect();
        if suppressed.is_empty() {
            Err(first)
        } else {
            Err(DatabaseError::Multiple {
                first: Box::new(first),
                suppressed,
            })
        }
    }
}
