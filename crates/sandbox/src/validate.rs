//! Read-only inspection of candidate memory images.
//!
//! Validation never fails: every problem is reported inside the returned
//! [`ValidationResult`]. The only I/O is an existence/size query and a read
//! of at most [`PREFIX_LEN`] bytes.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::FilePolicy;

/// Number of leading bytes inspected for a format signature.
pub const PREFIX_LEN: usize = 16;

/// Images at or above this size are flagged as resource-hungry.
pub const LARGE_IMAGE_THRESHOLD: u64 = 8 * 1024 * 1024 * 1024;

/// Known leading bytes per extension. Formats absent here (raw, mem, vmem,
/// ...) carry no header and are not signature-checked.
const SIGNATURES: &[(&str, &[&[u8]])] = &[
    ("dmp", &[b"PAGEDUMP", b"PAGEDU64", b"MDMP"]),
    ("lime", &[b"EMiL"]),
    ("core", &[b"\x7fELF"]),
    ("elf", &[b"\x7fELF"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    Matched,
    Mismatch,
    NotApplicable,
}

/// A reason a file was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("file does not exist")]
    Missing,

    #[error("not a regular file")]
    NotAFile,

    #[error("extension {extension:?} is not allowed")]
    DisallowedExtension { extension: String },

    #[error("file is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error("file cannot be read: {detail}")]
    Unreadable { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub path: PathBuf,
    pub valid: bool,
    pub size_bytes: Option<u64>,
    pub size_human: Option<String>,
    pub risk: RiskLevel,
    pub signature: SignatureCheck,
    pub reasons: Vec<Rejection>,
    pub warnings: Vec<String>,
}

/// Inspect `path` against `policy`.
pub async fn validate_file(path: &Path, policy: &FilePolicy) -> ValidationResult {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !policy.allows(&extension) {
        reasons.push(Rejection::DisallowedExtension {
            extension: extension.clone(),
        });
    }

    let mut size = None;
    let mut signature = SignatureCheck::NotApplicable;

    match tokio::fs::metadata(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => reasons.push(Rejection::Missing),
        Err(e) => reasons.push(Rejection::Unreadable {
            detail: e.to_string(),
        }),
        Ok(meta) if !meta.is_file() => reasons.push(Rejection::NotAFile),
        Ok(meta) => {
            let len = meta.len();
            size = Some(len);
            if len > policy.max_file_size {
                reasons.push(Rejection::TooLarge {
                    size: len,
                    max: policy.max_file_size,
                });
            }
            match read_prefix(path).await {
                Ok(prefix) => {
                    signature = check_signature(&extension, &prefix);
                    if signature == SignatureCheck::Mismatch {
                        warnings.push(format!(
                            "leading bytes do not match any known .{extension} signature"
                        ));
                    }
                }
                Err(e) => reasons.push(Rejection::Unreadable {
                    detail: e.to_string(),
                }),
            }
        }
    }

    let valid = reasons.is_empty();
    let risk = assess_risk(valid, size, signature);
    debug!(path = %path.display(), valid, ?risk, "validated input file");

    ValidationResult {
        path: path.to_path_buf(),
        valid,
        size_bytes: size,
        size_human: size.map(human_size),
        risk,
        signature,
        reasons,
        warnings,
    }
}

async fn read_prefix(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut prefix = Vec::with_capacity(PREFIX_LEN);
    file.take(PREFIX_LEN as u64).read_to_end(&mut prefix).await?;
    Ok(prefix)
}

fn check_signature(extension: &str, prefix: &[u8]) -> SignatureCheck {
    let Some((_, magics)) = SIGNATURES.iter().find(|(ext, _)| *ext == extension) else {
        return SignatureCheck::NotApplicable;
    };
    if magics.iter().any(|m| prefix.starts_with(m)) {
        SignatureCheck::Matched
    } else {
        SignatureCheck::Mismatch
    }
}

fn assess_risk(valid: bool, size: Option<u64>, signature: SignatureCheck) -> RiskLevel {
    if !valid {
        return RiskLevel::High;
    }
    let mut risk = RiskLevel::Low;
    if size == Some(0) {
        risk = risk.max(RiskLevel::High);
    }
    if signature == SignatureCheck::Mismatch {
        risk = risk.max(RiskLevel::Medium);
    }
    if size.is_some_and(|s| s >= LARGE_IMAGE_THRESHOLD) {
        risk = risk.max(RiskLevel::Medium);
    }
    risk
}

/// Format a byte count with 1024-based units, e.g. `1.00 KB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = "KB";
    for next in UNITS.iter().skip(1) {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2} {unit}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn policy(max: u64) -> FilePolicy {
        FilePolicy::new(["dmp", "raw", "mem", "lime"], max)
    }

    fn crash_dump_bytes(len: usize) -> Vec<u8> {
        let mut data = b"PAGEDU64".to_vec();
        data.resize(len, 0);
        data
    }

    #[tokio::test]
    async fn signed_dump_under_limit_is_valid_low_risk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.dmp");
        tokio::fs::write(&path, crash_dump_bytes(1024)).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(result.valid, "reasons: {:?}", result.reasons);
        assert_eq!(result.risk, RiskLevel::Low);
        assert_eq!(result.signature, SignatureCheck::Matched);
        assert_eq!(result.size_bytes, Some(1024));
        assert_eq!(result.size_human.as_deref(), Some("1.00 KB"));
        assert!(result.reasons.is_empty());
    }

    #[tokio::test]
    async fn exe_with_same_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.exe");
        tokio::fs::write(&path, crash_dump_bytes(1024)).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(!result.valid);
        assert_eq!(result.risk, RiskLevel::High);
        assert_eq!(
            result.reasons,
            vec![Rejection::DisallowedExtension {
                extension: "exe".into()
            }]
        );
        assert!(result.reasons[0].to_string().contains("\"exe\""));
    }

    #[tokio::test]
    async fn missing_file_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate_file(&dir.path().join("nonexistent.dmp"), &policy(GIB)).await;
        assert!(!result.valid);
        assert_eq!(result.reasons, vec![Rejection::Missing]);
        assert_eq!(result.size_bytes, None);
        assert_eq!(result.size_human, None);
    }

    #[tokio::test]
    async fn missing_file_with_bad_extension_reports_both() {
        let dir = tempfile::tempdir().unwrap();
        let result = validate_file(&dir.path().join("nope.exe"), &policy(GIB)).await;
        assert_eq!(result.reasons.len(), 2);
        assert!(result.reasons.contains(&Rejection::Missing));
    }

    #[tokio::test]
    async fn oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.raw");
        tokio::fs::write(&path, vec![0u8; 2048]).await.unwrap();

        let result = validate_file(&path, &policy(1024)).await;
        assert!(!result.valid);
        assert_eq!(
            result.reasons,
            vec![Rejection::TooLarge {
                size: 2048,
                max: 1024
            }]
        );
    }

    #[tokio::test]
    async fn signature_mismatch_raises_risk_but_stays_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.dmp");
        tokio::fs::write(&path, vec![0xAAu8; 512]).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(result.valid);
        assert_eq!(result.signature, SignatureCheck::Mismatch);
        assert_eq!(result.risk, RiskLevel::Medium);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn truncated_crash_dump_magic_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dmp");
        let mut data = b"PAGEDUM\x00".to_vec();
        data.resize(1024, 0);
        tokio::fs::write(&path, data).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(result.valid);
        assert_eq!(result.signature, SignatureCheck::Mismatch);
        assert_eq!(result.risk, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn headerless_format_is_not_signature_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.RAW");
        tokio::fs::write(&path, vec![0u8; 4096]).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(result.valid);
        assert_eq!(result.signature, SignatureCheck::NotApplicable);
        assert_eq!(result.risk, RiskLevel::Low);
    }

    #[tokio::test]
    async fn empty_file_is_high_risk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mem");
        tokio::fs::write(&path, b"").await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(result.valid);
        assert_eq!(result.risk, RiskLevel::High);
        assert_eq!(result.size_human.as_deref(), Some("0 B"));
    }

    #[tokio::test]
    async fn directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folder.dmp");
        tokio::fs::create_dir(&path).await.unwrap();

        let result = validate_file(&path, &policy(GIB)).await;
        assert!(!result.valid);
        assert_eq!(result.reasons, vec![Rejection::NotAFile]);
    }

    #[tokio::test]
    async fn validation_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("again.lime");
        tokio::fs::write(&path, b"EMiL\x01\x00\x00\x00").await.unwrap();

        let first = validate_file(&path, &policy(GIB)).await;
        let second = validate_file(&path, &policy(GIB)).await;
        assert_eq!(first, second);
        assert_eq!(first.signature, SignatureCheck::Matched);
    }

    #[test]
    fn large_valid_image_is_medium_risk() {
        assert_eq!(
            assess_risk(true, Some(LARGE_IMAGE_THRESHOLD), SignatureCheck::Matched),
            RiskLevel::Medium
        );
        assert_eq!(
            assess_risk(true, Some(1024), SignatureCheck::NotApplicable),
            RiskLevel::Low
        );
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1024), "1.00 KB");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(human_size(3 * GIB), "3.00 GB");
        assert_eq!(human_size(2048 * GIB), "2.00 TB");
    }
}
