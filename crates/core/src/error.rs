use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Rank {0} is outside the world of {1} ranks")]
    UnknownRank(u32, u32),

    #[error("{0}")]
    Other(String),
}
