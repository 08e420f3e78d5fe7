/// Status code type alias, a compact `u16` shared across all cache components.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const DATA_CORRUPTION: status_code_t = 2;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const NOT_INITIALIZED: status_code_t = 5;
    pub const IO_ERROR: status_code_t = 6;
    pub const INVALID_FORMAT: status_code_t = 7;
    pub const UNKNOWN: status_code_t = 999;
}

/// Put-transaction status codes (1xxx).
pub mod TrxCode {
    use super::status_code_t;

    pub const ALREADY_FINALIZED: status_code_t = 1000;
    pub const NOT_FINALIZED: status_code_t = 1001;
    pub const INCOMPLETE_WRITE: status_code_t = 1002;
    pub const WRITE_OVERFLOW: status_code_t = 1003;
    pub const INVALIDATED: status_code_t = 1004;
    pub const DUPLICATE_KIND: status_code_t = 1005;
}

/// Cache engine status codes (2xxx).
pub mod EngineCode {
    use super::status_code_t;

    pub const NOT_FOUND: status_code_t = 2000;
    pub const VERSION_LOCKED: status_code_t = 2001;
    pub const INIT_FAILED: status_code_t = 2002;
    pub const METADATA_LOAD_FAILED: status_code_t = 2003;
    pub const METADATA_SAVE_FAILED: status_code_t = 2004;
    pub const STAGING_FAILED: status_code_t = 2005;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    Trx = 1,
    Engine = 2,
}

/// Determine the type/category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        1000..=1999 => StatusCodeType::Trx,
        2000..=2999 => StatusCodeType::Engine,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::DATA_CORRUPTION => "DataCorruption",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::NOT_INITIALIZED => "NotInitialized",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::UNKNOWN => "Unknown",

        // Trx
        TrxCode::ALREADY_FINALIZED => "Trx::AlreadyFinalized",
        TrxCode::NOT_FINALIZED => "Trx::NotFinalized",
        TrxCode::INCOMPLETE_WRITE => "Trx::IncompleteWrite",
        TrxCode::WRITE_OVERFLOW => "Trx::WriteOverflow",
        TrxCode::INVALIDATED => "Trx::Invalidated",
        TrxCode::DUPLICATE_KIND => "Trx::DuplicateKind",

        // Engine
        EngineCode::NOT_FOUND => "Engine::NotFound",
        EngineCode::VERSION_LOCKED => "Engine::VersionLocked",
        EngineCode::INIT_FAILED => "Engine::InitFailed",
        EngineCode::METADATA_LOAD_FAILED => "Engine::MetadataLoadFailed",
        EngineCode::METADATA_SAVE_FAILED => "Engine::MetadataSaveFailed",
        EngineCode::STAGING_FAILED => "Engine::StagingFailed",

        _ => "UnknownStatusCode",
    }
}
