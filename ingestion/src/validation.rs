//! Validation chain run against a file before it enters the chunk/embed/
//! store pipeline.
//!
//! Nine strategies run in a fixed order, short-circuiting at the first
//! failing check. Severity decides what happens to a rejected file:
//! `Critical` sends it to quarantine, `Warning` blocks ingestion but leaves
//! it in place (tracked, not moved), `Info`/`None` allow it through.
//! Follows the same per-check struct-of-results shape used elsewhere in
//! this crate (`IngestionError`'s one-reason-per-failure style),
//! generalised to an ordered chain.

use ragkb_core::config::ValidationConfig;
use std::io::Read as _;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    None,
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub file_type: Option<String>,
    pub reason: Option<String>,
    pub validation_check: String,
    pub severity: Severity,
    pub matches: Vec<String>,
}

impl ValidationResult {
    fn ok(check: &str) -> Self {
        Self {
            is_valid: true,
            file_type: None,
            reason: None,
            validation_check: check.to_string(),
            severity: Severity::None,
            matches: Vec::new(),
        }
    }

    fn reject(check: &str, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            file_type: None,
            reason: Some(reason.into()),
            validation_check: check.to_string(),
            severity,
            matches: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationAction {
    Allow,
    TrackOnly,
    Quarantine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub results: Vec<ValidationResult>,
}

impl ValidationOutcome {
    fn from_results(results: Vec<ValidationResult>) -> Self {
        Self { results }
    }

    pub fn is_valid(&self) -> bool {
        self.results.iter().all(|r| r.is_valid)
    }

    pub fn worst_severity(&self) -> Severity {
        self.results
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::None)
    }

    /// The single failing result, if any. At most one ever exists: the
    /// chain stops running further checks as soon as one fails.
    pub fn failing(&self) -> Option<&ValidationResult> {
        self.results.iter().find(|r| !r.is_valid)
    }

    pub fn file_type(&self) -> Option<&str> {
        self.results.iter().find_map(|r| r.file_type.as_deref())
    }

    pub fn action(&self) -> ValidationAction {
        match self.worst_severity() {
            Severity::Critical => ValidationAction::Quarantine,
            Severity::Warning => ValidationAction::TrackOnly,
            Severity::Info | Severity::None => ValidationAction::Allow,
        }
    }
}

const TEXT_LIKE_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rs", "py", "js", "jsx", "mjs", "ts", "tsx", "go", "json", "toml",
    "yaml", "yml", "html", "css", "csv", "ipynb",
];

fn classify_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "pdf" => Some("pdf"),
        "docx" => Some("docx"),
        "epub" => Some("epub"),
        ext if TEXT_LIKE_EXTENSIONS.contains(&ext) => Some("text"),
        _ => None,
    }
}

fn is_zip_based(file_type: Option<&str>) -> bool {
    matches!(file_type, Some("docx") | Some("epub"))
}

fn is_document(file_type: Option<&str>) -> bool {
    matches!(file_type, Some("pdf") | Some("docx") | Some("epub"))
}

fn is_text_like(file_type: Option<&str>) -> bool {
    matches!(file_type, Some("text"))
}

/// Runs the nine validation strategies in SPEC order against a file on
/// disk. Only reads the file once; every subsequent strategy operates on
/// the bytes already in memory.
pub struct ValidationChain {
    config: ValidationConfig,
}

impl ValidationChain {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub async fn validate(&self, path: &Path) -> ValidationOutcome {
        let mut results = Vec::new();

        let existence = check_file_existence(path).await;
        let exists = existence.is_valid;
        results.push(existence);
        if !exists {
            return ValidationOutcome::from_results(results);
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                results.push(ValidationResult::reject(
                    "file_existence",
                    Severity::Warning,
                    format!("file unreadable: {err}"),
                ));
                return ValidationOutcome::from_results(results);
            }
        };

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        let extension_result = check_extension(extension.as_deref());
        let file_type = extension_result.file_type.clone();
        let valid = extension_result.is_valid;
        results.push(extension_result);
        if !valid {
            return ValidationOutcome::from_results(results);
        }

        let size_result = check_file_size(bytes.len() as u64, &self.config);
        let valid = size_result.is_valid;
        results.push(size_result);
        if !valid {
            return ValidationOutcome::from_results(results);
        }

        if is_zip_based(file_type.as_deref()) {
            let archive_result = check_archive_bomb(&bytes, &self.config);
            let valid = archive_result.is_valid;
            results.push(archive_result);
            if !valid {
                return ValidationOutcome::from_results(results);
            }
        }

        let mismatch_result = check_extension_mismatch(&bytes, file_type.as_deref());
        let valid = mismatch_result.is_valid;
        results.push(mismatch_result);
        if !valid {
            return ValidationOutcome::from_results(results);
        }

        let exec_result = check_executable_permission(path, &bytes).await;
        let valid = exec_result.is_valid;
        results.push(exec_result);
        if !valid {
            return ValidationOutcome::from_results(results);
        }

        if is_text_like(file_type.as_deref()) {
            let text_result = check_text_file(&bytes);
            let valid = text_result.is_valid;
            results.push(text_result);
            if !valid {
                return ValidationOutcome::from_results(results);
            }
        }

        if is_document(file_type.as_deref()) {
            let signature_result = check_magic_signature(&bytes, file_type.as_deref());
            let valid = signature_result.is_valid;
            results.push(signature_result);
            if !valid {
                return ValidationOutcome::from_results(results);
            }
        }

        if file_type.as_deref() == Some("pdf") {
            results.push(check_pdf_integrity(&bytes));
        }

        ValidationOutcome::from_results(results)
    }
}

async fn check_file_existence(path: &Path) -> ValidationResult {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.len() > 0 => ValidationResult::ok("file_existence"),
        Ok(_) => ValidationResult::reject("file_existence", Severity::Warning, "file is empty"),
        Err(_) => {
            ValidationResult::reject("file_existence", Severity::Warning, "file does not exist")
        }
    }
}

/// An unrecognized extension isn't itself evidence of anything
/// malicious (it's plenty common in code repos and export bundles), so
/// it warrants `Warning`/track-only, not quarantine. Quarantine is
/// reserved for checks that catch active deception about file type
/// (`ExtensionMismatch`/`MagicSignature`) or a payload exploit
/// (`ArchiveBomb`, `ExecutablePermission`'s shebang case).
fn check_extension(extension: Option<&str>) -> ValidationResult {
    let Some(extension) = extension else {
        return ValidationResult::reject(
            "extension",
            Severity::Warning,
            "missing file extension",
        );
    };

    match classify_extension(extension) {
        Some(file_type) => {
            let mut result = ValidationResult::ok("extension");
            result.file_type = Some(file_type.to_string());
            result
        }
        None => ValidationResult::reject(
            "extension",
            Severity::Warning,
            format!("unsupported extension: .{extension}"),
        ),
    }
}

fn check_file_size(len: u64, config: &ValidationConfig) -> ValidationResult {
    if len > config.max_file_size_bytes {
        return ValidationResult::reject(
            "file_size",
            Severity::Warning,
            format!(
                "{len} bytes exceeds hard cap of {}",
                config.max_file_size_bytes
            ),
        );
    }
    if len > config.warn_file_size_bytes {
        tracing::warn!(bytes = len, "file exceeds warn-size threshold");
    }
    ValidationResult::ok("file_size")
}

enum ArchiveInspectError {
    NestingTooDeep,
    Corrupt,
}

/// Recursively walks zip-based archives (a `.docx`/`.epub` containing
/// another zip entry) up to `max_depth`, accumulating uncompressed and
/// compressed totals so the caller can compute a compression ratio across
/// the whole nest, not just the outer container.
fn inspect_archive(
    bytes: &[u8],
    max_depth: u32,
    depth: u32,
) -> Result<(u64, u64), ArchiveInspectError> {
    if depth > max_depth {
        return Err(ArchiveInspectError::NestingTooDeep);
    }

    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).map_err(|_| ArchiveInspectError::Corrupt)?;

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|_| ArchiveInspectError::Corrupt)?;
        total_uncompressed += entry.size();
        total_compressed += entry.compressed_size();

        let name = entry.name().to_lowercase();
        if name.ends_with(".zip") || name.ends_with(".docx") || name.ends_with(".epub") {
            let mut nested_bytes = Vec::new();
            entry
                .read_to_end(&mut nested_bytes)
                .map_err(|_| ArchiveInspectError::Corrupt)?;
            let (nested_uncompressed, nested_compressed) =
                inspect_archive(&nested_bytes, max_depth, depth + 1)?;
            total_uncompressed += nested_uncompressed;
            total_compressed += nested_compressed;
        }
    }

    Ok((total_uncompressed, total_compressed))
}

fn check_archive_bomb(bytes: &[u8], config: &ValidationConfig) -> ValidationResult {
    match inspect_archive(bytes, config.archive_max_nesting_depth, 0) {
        Ok((total_uncompressed, total_compressed)) => {
            if total_uncompressed > config.archive_max_uncompressed_bytes {
                return ValidationResult::reject(
                    "archive_bomb",
                    Severity::Critical,
                    format!(
                        "uncompressed size {total_uncompressed} exceeds cap of {}",
                        config.archive_max_uncompressed_bytes
                    ),
                );
            }
            let ratio = if total_compressed == 0 {
                total_uncompressed as f64
            } else {
                total_uncompressed as f64 / total_compressed as f64
            };
            if ratio > config.archive_max_compression_ratio as f64 {
                return ValidationResult::reject(
                    "archive_bomb",
                    Severity::Critical,
                    format!("compression ratio {ratio:.1} exceeds cap"),
                );
            }
            ValidationResult::ok("archive_bomb")
        }
        Err(ArchiveInspectError::NestingTooDeep) => ValidationResult::reject(
            "archive_bomb",
            Severity::Critical,
            "archive nesting exceeds configured max depth",
        ),
        // Not a well-formed zip at all; MagicSignature below is responsible
        // for catching a docx/epub whose container itself is bogus.
        Err(ArchiveInspectError::Corrupt) => ValidationResult::ok("archive_bomb"),
    }
}

fn is_executable_mime(mime: &str) -> bool {
    matches!(
        mime,
        "application/x-executable"
            | "application/x-mach-binary"
            | "application/x-elf"
            | "application/x-dosexec"
            | "application/x-sharedlib"
    )
}

fn check_extension_mismatch(bytes: &[u8], file_type: Option<&str>) -> ValidationResult {
    if !is_document(file_type) {
        return ValidationResult::ok("extension_mismatch");
    }
    let Some(kind) = infer::get(bytes) else {
        return ValidationResult::ok("extension_mismatch");
    };
    if is_executable_mime(kind.mime_type()) {
        return ValidationResult::reject(
            "extension_mismatch",
            Severity::Critical,
            format!(
                "executable magic ({}) found under document extension",
                kind.mime_type()
            ),
        );
    }
    ValidationResult::ok("extension_mismatch")
}

#[cfg(unix)]
async fn check_executable_permission(path: &Path, bytes: &[u8]) -> ValidationResult {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(_) => return ValidationResult::ok("executable_permission"),
    };

    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0 {
        return ValidationResult::ok("executable_permission");
    }

    if bytes.starts_with(b"#!") {
        return ValidationResult::reject(
            "executable_permission",
            Severity::Critical,
            "executable shebang script under a non-script extension",
        );
    }

    // Remediable: strip the execute bits and re-check once.
    let mut perms = metadata.permissions();
    perms.set_mode(mode & !0o111);
    if tokio::fs::set_permissions(path, perms).await.is_err() {
        return ValidationResult::reject(
            "executable_permission",
            Severity::Critical,
            "executable bit set and could not be cleared",
        );
    }

    let cleared = tokio::fs::metadata(path)
        .await
        .map(|m| m.permissions().mode() & 0o111 == 0)
        .unwrap_or(false);

    if cleared {
        ValidationResult::ok("executable_permission")
    } else {
        ValidationResult::reject(
            "executable_permission",
            Severity::Critical,
            "executable bit persisted after remediation attempt",
        )
    }
}

#[cfg(not(unix))]
async fn check_executable_permission(_path: &Path, _bytes: &[u8]) -> ValidationResult {
    ValidationResult::ok("executable_permission")
}

fn check_text_file(bytes: &[u8]) -> ValidationResult {
    let sample = &bytes[..bytes.len().min(512)];
    if sample.is_empty() {
        return ValidationResult::ok("text_file");
    }

    let printable = sample
        .iter()
        .filter(|&&b| b == 0x09 || b == 0x0A || b == 0x0D || (0x20..=0x7E).contains(&b))
        .count();
    let ratio = printable as f64 / sample.len() as f64;

    if ratio > 0.9 {
        ValidationResult::ok("text_file")
    } else {
        ValidationResult::reject(
            "text_file",
            Severity::Warning,
            format!("printable byte ratio {ratio:.2} below threshold"),
        )
    }
}

fn check_magic_signature(bytes: &[u8], file_type: Option<&str>) -> ValidationResult {
    match file_type {
        Some("pdf") => {
            if bytes.starts_with(b"%PDF-") {
                ValidationResult::ok("magic_signature")
            } else {
                ValidationResult::reject(
                    "magic_signature",
                    Severity::Critical,
                    "missing %PDF- signature",
                )
            }
        }
        Some("docx") | Some("epub") => {
            if bytes.starts_with(b"PK\x03\x04") {
                ValidationResult::ok("magic_signature")
            } else {
                ValidationResult::reject(
                    "magic_signature",
                    Severity::Critical,
                    "missing zip local-file-header signature",
                )
            }
        }
        _ => ValidationResult::ok("magic_signature"),
    }
}

fn check_pdf_integrity(bytes: &[u8]) -> ValidationResult {
    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(_) => ValidationResult::ok("pdf_integrity"),
        Err(err) => ValidationResult::reject(
            "pdf_integrity",
            Severity::Warning,
            format!("pdf integrity check failed: {err}"),
        ),
    }
}
