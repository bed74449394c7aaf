/// Resource and job identifiers are opaque strings (UUID v4 when generated).
pub type ResourceId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh random identifier for a resource or job.
pub fn generate_id() -> ResourceId {
    uuid::Uuid::new_v4().to_string()
}
