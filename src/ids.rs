use std::sync::Mutex;

use anyhow::anyhow;
use ulid::{Generator, Ulid};
use validator::ValidationError;

use crate::error::{AppError, AppResult};

/// Mints message ids. Ids minted by one generator sort in creation order even
/// within the same millisecond.
#[derive(Default)]
pub struct IdGenerator {
    inner: Mutex<Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let mut generator = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match generator.generate() {
            Ok(id) => id.to_string(),
            Err(e) => {
                // Random part overflowed inside one millisecond.
                tracing::warn!(error = %e, "monotonic ulid overflow, falling back to a fresh ulid");
                Ulid::new().to_string()
            }
        }
    }
}

/// Parses a client supplied message id and returns its canonical form.
pub fn parse_message_id(raw: &str) -> AppResult<String> {
    Ulid::from_string(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| AppError::BadRequest(anyhow!("Invalid message id")))
}

pub fn validate_ulid(value: &str) -> Result<(), ValidationError> {
    Ulid::from_string(value.trim())
        .map(|_| ())
        .map_err(|_| ValidationError::new("ulid").with_message("must be a valid ULID".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_creation_order() {
        let generator = IdGenerator::new();
        let ids: Vec<String> = (0..1_000).map(|_| generator.next_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn parse_message_id_normalises_case() {
        let id = Ulid::new().to_string();
        assert_eq!(parse_message_id(&id.to_lowercase()).unwrap(), id);
    }

    #[test]
    fn parse_message_id_rejects_garbage() {
        assert!(matches!(
            parse_message_id("not-a-ulid"),
            Err(AppError::BadRequest(_))
        ));
        assert!(validate_ulid("01K6TGX42XQ6RK0M3QEXZ0P36Q").is_ok());
        assert!(validate_ulid("nope").is_err());
    }
}
