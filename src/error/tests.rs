//! Tests for error types.

#[cfg(test)]
mod tests {
    use super::super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("root must be absolute");
        assert_eq!(err.to_string(), "configuration error: root must be absolute");
    }

    #[test]
    fn test_subscription_error_messages() {
        assert_eq!(
            SubscriptionError::NoInitialResponse.to_string(),
            "no initial response"
        );
        assert_eq!(
            SubscriptionError::MissingClock.to_string(),
            "cannot determine initial clock"
        );
        assert_eq!(
            SubscriptionError::FreshInstance.to_string(),
            "received is_fresh_instance"
        );
        assert_eq!(
            SubscriptionError::protocol("expected value at line 1").to_string(),
            "expected value at line 1"
        );
    }

    #[test]
    fn test_rejected_quotes_payload() {
        let err = SubscriptionError::Rejected("\"unable to resolve root\"".to_string());
        assert!(err.to_string().contains("unable to resolve root"));
    }

    #[test]
    fn test_executable_not_found_mentions_search_path() {
        let err = ConnectionError::ExecutableNotFound {
            program: "watchman".to_string(),
            search_path: "/usr/bin:/bin".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("executable not found"));
        assert!(message.contains("/usr/bin:/bin"));
    }

    #[test]
    fn test_connection_error_exit_code() {
        assert_eq!(
            ConnectionError::ExitCode(2).to_string(),
            "discovery exited with code 2"
        );
        assert_eq!(
            ConnectionError::Signaled(9).to_string(),
            "discovery was killed by signal 9"
        );
    }

    #[test]
    fn test_connection_error_conversion() {
        let err: Error = ConnectionError::MissingSockname.into();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_subscription_error_conversion() {
        let err: Error = SubscriptionError::FreshInstance.into();
        assert!(matches!(
            err,
            Error::Subscription(SubscriptionError::FreshInstance)
        ));
        assert_eq!(
            err.to_string(),
            "subscription error: received is_fresh_instance"
        );
    }

    #[test]
    fn test_server_error_conversion() {
        let server_err = ServerError::BindFailed {
            address: "/tmp/server.sock".to_string(),
            reason: "address in use".to_string(),
        };
        let err: Error = server_err.into();
        assert!(matches!(err, Error::Server(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_internal() {
        let err = Error::internal("dispatcher gone");
        assert_eq!(err.to_string(), "internal error: dispatcher gone");
    }

    #[test]
    fn test_error_propagation_with_question_mark() {
        fn inner() -> Result<i32> {
            Err(SubscriptionError::MissingClock.into())
        }

        fn outer() -> Result<i32> {
            let _ = inner()?;
            Ok(0)
        }

        assert_eq!(
            outer().unwrap_err().to_string(),
            "subscription error: cannot determine initial clock"
        );
    }
}
