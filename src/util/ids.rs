//! Correlation and task identifiers.

use uuid::Uuid;

/// Build a request id of the form `<prefix>_<8 hex chars>`.
#[must_use]
pub fn request_id(prefix: &str) -> String {
    format!("{prefix}_{}", short_uuid())
}

/// Build a unique task name of the form `<kind>-<8 hex chars>`.
#[must_use]
pub fn task_name(kind: &str) -> String {
    format!("{kind}-{}", short_uuid())
}

fn short_uuid() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_are_unique() {
        let a = request_id("ping");
        let b = request_id("ping");
        assert!(a.starts_with("ping_"));
        assert_eq!(a.len(), "ping_".len() + 8);
        assert_ne!(a, b);
        assert!(task_name("ThinkTask").starts_with("ThinkTask-"));
    }
}
