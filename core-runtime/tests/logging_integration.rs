//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{
    init_logging, redact_if_sensitive, strip_path, LogFormat, LoggingConfig,
};

#[test]
fn test_pii_redaction_credentials() {
    assert_eq!(redact_if_sensitive("access_token", "at"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("refresh_token", "rt"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("code_verifier", "v"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("Authorization", "Bearer x"), "[REDACTED]");
}

#[test]
fn test_signed_url_query_is_dropped() {
    let redacted = redact_if_sensitive(
        "upload_url",
        "https://bj29.cn-beijing.data.alicloudccp.com/part?x-oss-signature=abc",
    );
    assert_eq!(
        redacted,
        "https://bj29.cn-beijing.data.alicloudccp.com/part?[REDACTED]"
    );
    assert!(!redacted.contains("signature"));
}

#[test]
fn test_pii_redaction_normal_values() {
    assert_eq!(redact_if_sensitive("file_id", "5f2a"), "5f2a");
    assert_eq!(redact_if_sensitive("name", "report.pdf"), "report.pdf");
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/var/tmp/a.bin.download"), "a.bin.download");
    assert_eq!(strip_path("D:\\data\\file.txt"), "file.txt");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_init_logging_only_once() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    assert!(init_logging(config.clone()).is_ok());
    assert!(init_logging(config).is_err());
}

#[test]
fn test_invalid_filter_rejected() {
    let config = LoggingConfig::default().with_filter("core_auth=notalevel[");
    assert!(init_logging(config).is_err());
}
