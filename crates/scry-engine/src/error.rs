use scry_jdwp::JdwpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Jdwp(#[from] JdwpError),

    /// The line has no executable code in the loaded class.
    #[error("no executable code at {class}:{line}")]
    UnresolvableLocation { class: String, line: u32 },

    #[error("class {0} is not watched by this session")]
    UnknownClass(String),

    #[error("failed to launch target: {0}")]
    Launch(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
