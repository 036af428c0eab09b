//! C-callable verification entry point for other processes and languages.
//!
//! The symbol is exported from the `keel_plugin` shared library
//! (`libkeel_plugin.so`, `keel_plugin.dll`, `libkeel_plugin.dylib`), which the
//! crate builds alongside its rlib. The `keel` executable does not export it;
//! from there the same check is `keel verify`.

use std::ffi::{CStr, c_char};
use std::path::Path;

use crate::verify::{Ed25519Verifier, SignatureVerifier, Verification};

/// Verify a detached manifest signature.
///
/// Returns `0` when valid, `1` when invalid and `2` on an execution error,
/// including null or non-UTF-8 arguments.
///
/// # Safety
///
/// Each argument must be null or a NUL-terminated string valid for the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keel_verify_manifest(
    manifest_path: *const c_char,
    signature_path: *const c_char,
    public_key_path: *const c_char,
) -> i32 {
    // SAFETY: per the function contract.
    let paths = unsafe {
        (
            path_arg(manifest_path),
            path_arg(signature_path),
            path_arg(public_key_path),
        )
    };
    let (Some(manifest), Some(signature), Some(key)) = paths else {
        return Verification::Error {
            reason: "invalid path argument".into(),
        }
        .exit_code();
    };
    std::panic::catch_unwind(|| {
        Ed25519Verifier
            .verify(Path::new(manifest), Path::new(signature), Path::new(key))
            .exit_code()
    })
    .unwrap_or(2)
}

unsafe fn path_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null, NUL-terminated per the caller's contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}
