use anyhow::Context;
use std::path::Path;

use keel_plugin::{Ed25519Verifier, PluginManifest, SignatureVerifier, Verification};

/// Exit code mirrors [`Verification::exit_code`].
pub(super) fn cmd_verify(manifest: &Path, sig: &Path, pubkey: &Path) -> i32 {
    let outcome = Ed25519Verifier.verify(manifest, sig, pubkey);
    match &outcome {
        Verification::Valid => println!("valid: {}", manifest.display()),
        Verification::Invalid { reason } => println!("invalid: {reason}"),
        Verification::Error { reason } => eprintln!("error: {reason}"),
    }
    outcome.exit_code()
}

pub(super) fn cmd_validate(path: &Path) -> anyhow::Result<i32> {
    let manifest = PluginManifest::from_path(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let problems = manifest.validate();
    if problems.is_empty() {
        println!("{} {} ok", manifest.id, manifest.version);
        return Ok(0);
    }
    for problem in &problems {
        println!("  - {problem}");
    }
    println!("{} problem(s) in {}", problems.len(), path.display());
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.manifest.json");
        std::fs::write(
            &good,
            r#"{"id":"org.test.good","name":"Good","version":"1.0.0","capabilities":["notifications"]}"#,
        )
        .unwrap();
        assert_eq!(cmd_validate(&good).unwrap(), 0);

        let bad = dir.path().join("bad.manifest.json");
        std::fs::write(&bad, r#"{"id":"bad","version":"x"}"#).unwrap();
        assert_eq!(cmd_validate(&bad).unwrap(), 1);

        assert!(cmd_validate(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn verify_missing_inputs_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nothing");
        assert_eq!(cmd_verify(&p, &p, &p), 2);
    }
}
