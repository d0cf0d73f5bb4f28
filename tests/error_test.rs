use chain_query::{KeyPart, QueryError, Result, key};

#[test]
fn test_error_display() {
    let err = QueryError::producer("execution reverted");
    assert_eq!(err.to_string(), "producer error: execution reverted");
}

#[test]
fn test_type_mismatch_names_key() {
    let err = QueryError::TypeMismatch {
        key: key!["pool", 7, "nav"],
    };
    assert!(err.to_string().contains(r#"["pool", 7, "nav"]"#));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(QueryError::Completed)
    }
    assert!(returns_error().is_err());
}

// ============================================================================
// Retry classification
// ============================================================================

#[test]
fn retryable_errors() {
    assert!(QueryError::Producer("rpc timeout".into()).is_retryable());
    assert!(QueryError::Closed.is_retryable());
}

#[test]
fn misuse_errors_are_not_retryable() {
    assert!(!QueryError::InvalidOptions("x".into()).is_retryable());
    assert!(!QueryError::TypeMismatch { key: key!["x"] }.is_retryable());
    assert!(!QueryError::Configuration("x".into()).is_retryable());
    assert!(!QueryError::NoRuntime.is_retryable());
    assert!(!QueryError::Completed.is_retryable());
}

// ============================================================================
// Conversions
// ============================================================================

#[test]
fn errors_are_cloneable_for_fan_out() {
    let err = QueryError::producer("indexer unavailable");
    let copies = vec![err.clone(), err.clone()];
    assert!(copies.iter().all(|e| *e == err));
}

#[test]
fn unserializable_digest_is_invalid_options() {
    use std::collections::HashMap;

    // JSON object keys must be strings.
    let mut map = HashMap::new();
    map.insert((1u8, 2u8), "x");
    let err = KeyPart::digest(&map).unwrap_err();
    assert!(matches!(err, QueryError::InvalidOptions(_)));
}
