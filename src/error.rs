use serenity::model::prelude::GuildId;
use thiserror::Error;

use crate::crypto::CipherError;

/// Failure talking to the invite/settings store. Fatal to a running check.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("no settings stored for guild {0}")]
    MissingSetting(GuildId),
    #[error("guild {0} is running an invite check")]
    CheckRunning(GuildId),
    #[error("{0} record was not written")]
    NotWritten(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;
