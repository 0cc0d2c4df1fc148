use thiserror::Error;

/// Numeric response codes carried on the wire and translated by the
/// client into diagnostics.
pub mod codes {
    pub const GENERAL_ERROR: i32 = -1;
    pub const OK: i32 = 0;
    pub const COMM_ERROR: i32 = 1001;
    pub const ATTR_FORMAT: i32 = 1002;
    pub const FS_CHECK_ERROR: i32 = 1003;
    pub const FS_ADD_ERROR: i32 = 1004;
    pub const TAPE_EXISTS_IN_POOL: i32 = 1005;
    pub const TAPE_NOT_EXISTS_IN_POOL: i32 = 1006;
    pub const POOL_EXISTS: i32 = 1007;
    pub const POOL_NOT_EXISTS: i32 = 1008;
    pub const TAPE_NOT_EXISTS: i32 = 1009;
    pub const POOL_NOT_EMPTY: i32 = 1010;
    pub const WRONG_POOLNUM: i32 = 1011;
    pub const NOT_ALL_POOLS_EXIST: i32 = 1012;
    pub const DRIVE_BUSY: i32 = 1013;
    pub const ALREADY_FORMATTED: i32 = 1050;
    pub const WRITE_PROTECTED: i32 = 1051;
    pub const TAPE_STATE_ERR: i32 = 1052;
    pub const INACCESSIBLE: i32 = 1054;
    pub const TERMINATING: i32 = 1090;
}

#[derive(Error, Debug)]
pub enum DmError {
    #[error("communication error: {0}")]
    Comm(String),
    #[error("invalid attribute format: {0}")]
    AttrFormat(String),
    #[error("file system check failed: {0}")]
    FsCheck(String),
    #[error("adding file system failed: {0}")]
    FsAdd(String),
    #[error("tape already belongs to a pool: {0}")]
    TapeExistsInPool(String),
    #[error("tape is not member of pool: {0}")]
    TapeNotExistsInPool(String),
    #[error("pool already exists: {0}")]
    PoolExists(String),
    #[error("pool does not exist: {0}")]
    PoolNotExists(String),
    #[error("tape does not exist: {0}")]
    TapeNotExists(String),
    #[error("pool is not empty: {0}")]
    PoolNotEmpty(String),
    #[error("wrong number of pools: {0}")]
    WrongPoolNum(usize),
    #[error("not all pools exist: {0}")]
    NotAllPoolsExist(String),
    #[error("drive is busy: {0}")]
    DriveBusy(String),
    #[error("tape already formatted: {0}")]
    AlreadyFormatted(String),
    #[error("tape is write protected: {0}")]
    WriteProtected(String),
    #[error("invalid tape state: {0}")]
    TapeStateErr(String),
    #[error("tape not accessible: {0}")]
    Inaccessible(String),
    #[error("server is terminating")]
    Terminating,
    #[error("file state does not allow the operation: {0}")]
    WrongFileState(String),
    #[error("file already scheduled: {0}")]
    DuplicateJob(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DmError {
    /// Wire code for this error; internal kinds collapse to GENERAL_ERROR.
    pub fn code(&self) -> i32 {
        match self {
            DmError::Comm(_) => codes::COMM_ERROR,
            DmError::AttrFormat(_) => codes::ATTR_FORMAT,
            DmError::FsCheck(_) => codes::FS_CHECK_ERROR,
            DmError::FsAdd(_) => codes::FS_ADD_ERROR,
            DmError::TapeExistsInPool(_) => codes::TAPE_EXISTS_IN_POOL,
            DmError::TapeNotExistsInPool(_) => codes::TAPE_NOT_EXISTS_IN_POOL,
            DmError::PoolExists(_) => codes::POOL_EXISTS,
            DmError::PoolNotExists(_) => codes::POOL_NOT_EXISTS,
            DmError::TapeNotExists(_) => codes::TAPE_NOT_EXISTS,
            DmError::PoolNotEmpty(_) => codes::POOL_NOT_EMPTY,
            DmError::WrongPoolNum(_) => codes::WRONG_POOLNUM,
            DmError::NotAllPoolsExist(_) => codes::NOT_ALL_POOLS_EXIST,
            DmError::DriveBusy(_) => codes::DRIVE_BUSY,
            DmError::AlreadyFormatted(_) => codes::ALREADY_FORMATTED,
            DmError::WriteProtected(_) => codes::WRITE_PROTECTED,
            DmError::TapeStateErr(_) => codes::TAPE_STATE_ERR,
            DmError::Inaccessible(_) => codes::INACCESSIBLE,
            DmError::Terminating => codes::TERMINATING,
            _ => codes::GENERAL_ERROR,
        }
    }

    pub fn is_duplicate_job(&self) -> bool {
        matches!(self, DmError::DuplicateJob(_))
    }
}

/// Client-side translation of a wire code into a diagnostic.
pub fn describe_code(code: i32) -> &'static str {
    match code {
        codes::OK => "success",
        codes::COMM_ERROR => "communication with the backend failed",
        codes::ATTR_FORMAT => "invalid attribute format",
        codes::FS_CHECK_ERROR => "file system check failed",
        codes::FS_ADD_ERROR => "adding the file system failed",
        codes::TAPE_EXISTS_IN_POOL => "tape already belongs to a pool",
        codes::TAPE_NOT_EXISTS_IN_POOL => "tape is not member of the pool",
        codes::POOL_EXISTS => "pool already exists",
        codes::POOL_NOT_EXISTS => "pool does not exist",
        codes::TAPE_NOT_EXISTS => "tape does not exist",
        codes::POOL_NOT_EMPTY => "pool still contains tapes",
        codes::WRONG_POOLNUM => "wrong number of pools (1..3 required)",
        codes::NOT_ALL_POOLS_EXIST => "not all specified pools exist",
        codes::DRIVE_BUSY => "drive is busy",
        codes::ALREADY_FORMATTED => "tape already formatted",
        codes::WRITE_PROTECTED => "tape is write protected",
        codes::TAPE_STATE_ERR => "tape is in an invalid state",
        codes::INACCESSIBLE => "tape not accessible",
        codes::TERMINATING => "the backend is terminating",
        _ => "general error",
    }
}

pub type DmResult<T> = std::result::Result<T, DmError>;

impl From<std::io::Error> for DmError {
    fn from(err: std::io::Error) -> Self {
        DmError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DmError {
    fn from(err: serde_json::Error) -> Self {
        DmError::AttrFormat(err.to_string())
    }
}
