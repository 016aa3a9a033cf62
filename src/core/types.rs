use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;
use super::{DataType, ProxyError, Result, Value};

pub type Row = Vec<Value>;

/// Connection property bag passed through `connect`.
pub type Properties = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub label: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(ProxyError::database_with_state(
                    format!("Column '{}' cannot be NULL", self.name),
                    "23502",
                ));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(ProxyError::database_with_state(
                format!(
                    "Column '{}' expects type {}, got {}",
                    self.name,
                    self.data_type,
                    value.type_name()
                ),
                "42804",
            ));
        }

        Ok(())
    }
}

/// Finds a column by label first, then by name, ignoring ASCII case.
pub fn find_column(columns: &[ColumnMeta], label: &str) -> Option<usize> {
    columns
        .iter()
        .position(|c| c.label.eq_ignore_ascii_case(label))
        .or_else(|| columns.iter().position(|c| c.name.eq_ignore_ascii_case(label)))
}

// ============================================================================
// Object identifiers
// ============================================================================

/// Server-assigned identifier of a registered remote object.
///
/// The two auxiliary integers piggy-back small scalars (for example the
/// initial row limit and query timeout of a statement) on the registration
/// response. They take no part in equality or hashing and are cleared once
/// read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Uid {
    value: u64,
    aux_1: Option<i64>,
    aux_2: Option<i64>,
}

impl Uid {
    pub fn new(value: u64) -> Self {
        Self {
            value,
            aux_1: None,
            aux_2: None,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn with_aux(mut self, aux_1: Option<i64>, aux_2: Option<i64>) -> Self {
        self.aux_1 = aux_1;
        self.aux_2 = aux_2;
        self
    }

    pub fn aux(&self) -> (Option<i64>, Option<i64>) {
        (self.aux_1, self.aux_2)
    }

    pub fn take_aux(&mut self) -> (Option<i64>, Option<i64>) {
        (self.aux_1.take(), self.aux_2.take())
    }

    /// The identifier without its auxiliary values.
    pub fn plain(&self) -> Self {
        Self::new(self.value)
    }
}

impl PartialEq for Uid {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Uid {}

impl Hash for Uid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.value)
    }
}

/// Process-wide source of object identifiers.
///
/// One generator is created by the dispatcher and shared with every session,
/// so identifiers are unique for the lifetime of the process and strictly
/// increasing in registration order.
#[derive(Debug)]
pub struct UidGenerator {
    next: AtomicU64,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Uid {
        Uid::new(self.next.fetch_add(1, Ordering::SeqCst))
    }

    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - 1
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProxyError::MalformedCommand(format!("invalid session id '{}': {}", s, e)))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Remote object kinds and payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Connection,
    Statement,
    PreparedStatement,
    CallableStatement,
    Cursor,
    MetaData,
    Savepoint,
    Blob,
    Clob,
}

impl ObjectKind {
    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            Self::Statement | Self::PreparedStatement | Self::CallableStatement
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::PreparedStatement => "prepared statement",
            Self::CallableStatement => "callable statement",
            Self::Cursor => "cursor",
            Self::MetaData => "metadata",
            Self::Savepoint => "savepoint",
            Self::Blob => "blob",
            Self::Clob => "clob",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavepointInfo {
    pub id: u64,
    pub name: Option<String>,
}

/// Where a remote object was created on the client, attached to calls only
/// when the session asked for it (it is expensive to capture).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugContext {
    pub label: String,
    pub captured_at: DateTime<Utc>,
    pub trace: String,
}

impl DebugContext {
    pub fn capture(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            captured_at: Utc::now(),
            trace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            captured_at: Utc::now(),
            trace: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_generator_is_strictly_increasing() {
        let generator = UidGenerator::new();
        let mut previous = generator.next();
        for _ in 0..1000 {
            let uid = generator.next();
            assert!(uid > previous);
            previous = uid;
        }
        assert_eq!(generator.issued(), 1001);
    }

    #[test]
    fn test_uid_aux_is_ignored_by_equality_and_cleared_on_take() {
        let mut uid = Uid::new(7).with_aux(Some(100), Some(30));
        assert_eq!(uid, Uid::new(7));
        assert_eq!(uid.take_aux(), (Some(100), Some(30)));
        assert_eq!(uid.aux(), (None, None));
    }

    #[test]
    fn test_find_column_prefers_label() {
        let columns = vec![
            ColumnMeta::new("id", DataType::Integer).with_label("user_id"),
            ColumnMeta::new("user_id", DataType::Integer),
        ];
        assert_eq!(find_column(&columns, "USER_ID"), Some(0));
        assert_eq!(find_column(&columns, "id"), Some(0));
        assert_eq!(find_column(&columns, "missing"), None);
    }

    #[test]
    fn test_session_id_parse_round_trip() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_string()).unwrap(), id);
        assert!(SessionId::parse("not-a-uuid").is_err());
    }
}
