use crate::status::Status;
use crate::status_code::status_code_t;

/// The standard result type used throughout the cache, with `Status` as the error.
pub type Result<T> = std::result::Result<T, Status>;

/// Create an error result from a status code.
pub fn make_error<T>(code: status_code_t) -> Result<T> {
    Err(Status::new(code))
}

/// Create an error result from a status code and message.
pub fn make_error_msg<T>(code: status_code_t, msg: impl Into<String>) -> Result<T> {
    Err(Status::with_message(code, msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{EngineCode, StatusCode, TrxCode};

    #[test]
    fn test_make_error() {
        let r: Result<i32> = make_error(EngineCode::NOT_FOUND);
        assert!(r.is_err());
        assert_eq!(r.unwrap_err().code(), 2000);
    }

    #[test]
    fn test_make_error_msg() {
        let r: Result<i32> = make_error_msg(StatusCode::INVALID_ARG, "bad kind");
        let err = r.unwrap_err();
        assert_eq!(err.code(), 3);
        assert_eq!(err.message(), Some("bad kind"));
    }

    #[test]
    fn test_question_mark_propagation() {
        fn inner() -> Result<()> {
            make_error(TrxCode::INCOMPLETE_WRITE)
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        assert_eq!(outer().unwrap_err().code(), TrxCode::INCOMPLETE_WRITE);
    }
}
