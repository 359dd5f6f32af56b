//! Error type for the nitriding client library

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error in response from nitriding: {0}")]
    ServerError(String),
    #[error("Unexpected response from nitriding: {0}")]
    UnexpectedResponse(String),
    #[error("{0}")]
    Connection(shared::Error),
    #[error("{0}")]
    MsgError(shared::MsgError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
