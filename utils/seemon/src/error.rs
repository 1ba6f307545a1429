use thiserror::Error;

use crate::config::ConfigError;
use crate::regmap::RegisterError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
