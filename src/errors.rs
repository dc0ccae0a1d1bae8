use std::io;

use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{service} responded with status {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Config(String),
    #[error("text fix queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

/// Coarse failure classes reported in logs and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Parse,
    Validation,
    Exhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Parse => "parse",
            FailureKind::Validation => "validation",
            FailureKind::Exhausted => "exhausted",
        }
    }
}

impl AppError {
    /// Storage, task and configuration problems count as network failures: they all mean an
    /// external collaborator could not be reached.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Json(_) | AppError::Csv(_) | AppError::Parse(_) => FailureKind::Parse,
            AppError::Validation(_) => FailureKind::Validation,
            AppError::Io(_)
            | AppError::Database(_)
            | AppError::Http(_)
            | AppError::Status { .. }
            | AppError::Config(_)
            | AppError::QueueClosed
            | AppError::Task(_) => FailureKind::Network,
        }
    }
}
