//! Manifest signature verification.
//!
//! The boolean answer is all the loader acts on; the [`Verification`] value
//! keeps the diagnostic, separating a bad signature from a verifier that could
//! not run at all.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ring::signature::{ED25519, UnparsedPublicKey};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::manifest::{PluginManifest, Sidecar, canonical_bytes};
use keel_config::{PluginsConfig, VerifierConfig, VerifierKind};
use keel_core::{KeelError, Result};

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    /// The inputs were readable but the signature does not hold.
    Invalid { reason: String },
    /// The check could not be carried out (I/O failure, verifier missing).
    Error { reason: String },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }

    /// `0` valid, `1` invalid, `2` execution error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verification::Valid => 0,
            Verification::Invalid { .. } => 1,
            Verification::Error { .. } => 2,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Verification::Invalid {
            reason: reason.into(),
        }
    }

    fn error(reason: impl Into<String>) -> Self {
        Verification::Error {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Valid => f.write_str("valid"),
            Verification::Invalid { reason } => write!(f, "invalid: {reason}"),
            Verification::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

/// The three inputs of one verification. Lives only for the call.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub manifest_bytes: Vec<u8>,
    /// Base64 text of a 64-byte Ed25519 signature.
    pub signature_bytes: Vec<u8>,
    /// Base64 text of a 32-byte Ed25519 public key.
    pub public_key_bytes: Vec<u8>,
}

impl ManifestRecord {
    pub fn read(manifest: &Path, signature: &Path, public_key: &Path) -> std::io::Result<Self> {
        Ok(Self {
            manifest_bytes: std::fs::read(manifest)?,
            signature_bytes: std::fs::read(signature)?,
            public_key_bytes: std::fs::read(public_key)?,
        })
    }

    /// Check the Ed25519 signature over the canonical manifest bytes.
    pub fn verify(&self) -> Verification {
        let Ok(key) = STANDARD.decode(self.public_key_bytes.trim_ascii()) else {
            return Verification::invalid("public key is not valid base64");
        };
        if key.len() != 32 {
            return Verification::invalid(format!("public key is {} bytes, expected 32", key.len()));
        }
        let Ok(signature) = STANDARD.decode(self.signature_bytes.trim_ascii()) else {
            return Verification::invalid("signature is not valid base64");
        };
        if signature.len() != 64 {
            return Verification::invalid(format!(
                "signature is {} bytes, expected 64",
                signature.len()
            ));
        }
        let Ok(message) = canonical_bytes(&self.manifest_bytes) else {
            return Verification::invalid("manifest is not valid JSON");
        };
        match UnparsedPublicKey::new(&ED25519, &key).verify(&message, &signature) {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::invalid("signature does not match manifest"),
        }
    }
}

/// A routine that checks a detached manifest signature.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, manifest: &Path, signature: &Path, public_key: &Path) -> Verification;
}

/// In-process Ed25519 verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, manifest: &Path, signature: &Path, public_key: &Path) -> Verification {
        match ManifestRecord::read(manifest, signature, public_key) {
            Ok(record) => record.verify(),
            Err(e) => Verification::error(format!("failed to read verification inputs: {e}")),
        }
    }
}

/// Runs an external verifier: `<program> <args..> --manifest M --sig S --pubkey K`.
/// Exit status 0 is valid, 1 is invalid, anything else is an execution error.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandVerifier {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl SignatureVerifier for CommandVerifier {
    fn verify(&self, manifest: &Path, signature: &Path, public_key: &Path) -> Verification {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--manifest")
            .arg(manifest)
            .arg("--sig")
            .arg(signature)
            .arg("--pubkey")
            .arg(public_key)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Err(e) => Verification::error(format!(
                "failed to run {}: {e}",
                self.program.display()
            )),
            Ok(status) => match status.code() {
                Some(0) => Verification::Valid,
                Some(1) => Verification::invalid("external verifier rejected the signature"),
                Some(code) => Verification::error(format!("external verifier exited with {code}")),
                None => Verification::error("external verifier was terminated by a signal"),
            },
        }
    }
}

/// Front door for manifest verification.
#[derive(Clone)]
pub struct ManifestVerifier {
    backend: Arc<dyn SignatureVerifier>,
}

impl ManifestVerifier {
    pub fn new(backend: impl SignatureVerifier + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn builtin() -> Self {
        Self::new(Ed25519Verifier)
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        match (config.kind, &config.command) {
            (VerifierKind::Command, Some(program)) => {
                Self::new(CommandVerifier::new(program.clone(), config.args.clone()))
            }
            _ => Self::builtin(),
        }
    }

    /// `true` iff the signature is valid for the current manifest bytes.
    pub fn verify(&self, manifest: &Path, signature: &Path, public_key: &Path) -> bool {
        self.check(manifest, signature, public_key).is_valid()
    }

    /// Same as [`verify`](Self::verify) but keeps the diagnostic.
    pub fn check(&self, manifest: &Path, signature: &Path, public_key: &Path) -> Verification {
        let outcome = self.backend.verify(manifest, signature, public_key);
        match &outcome {
            Verification::Valid => debug!(?manifest, "manifest signature valid"),
            Verification::Invalid { reason } => {
                warn!(?manifest, reason = %reason, "manifest signature invalid")
            }
            Verification::Error { reason } => {
                warn!(?manifest, reason = %reason, "manifest verification could not run")
            }
        }
        outcome
    }
}

impl Default for ManifestVerifier {
    fn default() -> Self {
        Self::builtin()
    }
}

/// What the trust gate established about a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trust {
    /// No manifest accompanies the module (allowed when signatures are optional).
    Unsigned,
    /// Manifest signature checked against the trusted key.
    Verified(PluginManifest),
}

impl Trust {
    pub fn manifest(&self) -> Option<&PluginManifest> {
        match self {
            Trust::Unsigned => None,
            Trust::Verified(m) => Some(m),
        }
    }
}

/// Decides, before a module is opened, whether it may be loaded at all.
#[derive(Clone)]
pub struct TrustGate {
    verifier: ManifestVerifier,
    trusted_key: Option<PathBuf>,
    require_signatures: bool,
}

impl TrustGate {
    pub fn new(
        verifier: ManifestVerifier,
        trusted_key: Option<PathBuf>,
        require_signatures: bool,
    ) -> Self {
        Self {
            verifier,
            trusted_key,
            require_signatures,
        }
    }

    /// No key, nothing required: every module is `Unsigned`.
    pub fn open() -> Self {
        Self::new(ManifestVerifier::builtin(), None, false)
    }

    pub fn from_config(config: &PluginsConfig) -> Self {
        Self::new(
            ManifestVerifier::from_config(&config.verifier),
            config.trusted_key.clone(),
            config.require_signatures,
        )
    }

    /// A module with a sidecar manifest is only ever `Verified` or rejected.
    /// The manifest returned is parsed from the same bytes the verifier saw.
    pub fn check(&self, module: &Path) -> Result<Trust> {
        let sidecar = Sidecar::for_module(module);
        let rejected = |reason: String| KeelError::Verification {
            path: module.to_path_buf(),
            reason,
        };

        if !sidecar.exists() {
            if self.require_signatures {
                return Err(rejected("no signed manifest accompanies the module".into()));
            }
            return Ok(Trust::Unsigned);
        }

        let Some(key) = &self.trusted_key else {
            return Err(rejected("manifest present but no trusted key configured".into()));
        };

        let snapshot = std::fs::read(&sidecar.manifest)
            .map_err(|e| rejected(format!("failed to read manifest: {e}")))?;
        let outcome = self.verifier.check(&sidecar.manifest, &sidecar.signature, key);
        if !outcome.is_valid() {
            return Err(rejected(outcome.to_string()));
        }
        let after = std::fs::read(&sidecar.manifest)
            .map_err(|e| rejected(format!("failed to re-read manifest: {e}")))?;
        if after != snapshot {
            return Err(rejected("manifest changed during verification".into()));
        }

        let manifest = PluginManifest::from_json(&snapshot)
            .map_err(|e| rejected(format!("signed manifest is unreadable: {e}")))?;
        Ok(Trust::Verified(manifest))
    }
}
