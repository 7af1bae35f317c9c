use anyhow::anyhow;
use serde::Serialize;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Database,
    Conflict,
    InvalidInput,
    NotFound,
    Cancelled,
    Unknown,
}

/// Coarse classification for request layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request was rejected before anything was written.
    Validation,
    NotFound,
    /// The store refused the write (duplicate id, dangling endpoint).
    Conflict,
    Server,
}

impl ErrorKind {
    pub const fn class(self) -> ErrorClass {
        match self {
            ErrorKind::InvalidInput => ErrorClass::Validation,
            ErrorKind::NotFound => ErrorClass::NotFound,
            ErrorKind::Conflict => ErrorClass::Conflict,
            ErrorKind::Database | ErrorKind::Cancelled | ErrorKind::Unknown => ErrorClass::Server,
        }
    }
}

/// Where in an operation a failure surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Reference resolution and validation, before a transaction is opened.
    Prepare,
    Read,
    Write,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSide {
    From,
    To,
}

impl EdgeSide {
    pub const fn as_str(self) -> &'static str {
        match self {
            EdgeSide::From => "from",
            EdgeSide::To => "to",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorDetails {
    UnknownReference { reference: String, side: EdgeSide },
    DuplicateReference { reference: String },
    CycleDetected { path: Vec<String> },
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub details: Option<ErrorDetails>,
    pub stage: Option<Stage>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            details: None,
            stage: None,
            source,
        }
    }

    pub fn conflict(code: &'static str, public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code,
            public,
            details: None,
            stage: None,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self::invalid_with_code("invalid_input", public, source)
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            details: None,
            stage: Some(Stage::Prepare),
            source,
        }
    }

    pub fn unknown_reference(reference: &str, side: EdgeSide) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "unknown_node_ref",
            public: "Edge references an unknown node ref",
            details: Some(ErrorDetails::UnknownReference {
                reference: reference.to_string(),
                side,
            }),
            stage: Some(Stage::Prepare),
            source: anyhow!("unknown {}_node_ref {:?}", side.as_str(), reference),
        }
    }

    pub fn not_found(code: &'static str, public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code,
            public,
            details: None,
            stage: None,
            source,
        }
    }

    pub fn cancelled(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            code: "operation_cancelled",
            public,
            details: None,
            stage: None,
            source,
        }
    }

    pub fn unknown(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "unknown_error",
            public,
            details: None,
            stage: None,
            source,
        }
    }

    pub fn message(public: &'static str) -> Self {
        Self::unknown(public, anyhow!(public))
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Records the stage unless a more specific one was already set.
    pub fn at(mut self, stage: Stage) -> Self {
        self.stage.get_or_insert(stage);
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_cycle(&self) -> bool {
        self.code == "graph_cycle"
    }

    /// True when the failure happened before any write statement was issued.
    pub fn nothing_written(&self) -> bool {
        !matches!(self.stage, Some(Stage::Write | Stage::Commit))
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow!(value))
    }
}
