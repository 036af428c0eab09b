//! Opening modules and resolving their entry symbol.
//!
//! A [`Module`] is the scoped owner of an OS module handle: dropping it closes
//! the handle, so every early return during loading releases it.

use std::path::{Path, PathBuf};

use crate::abi::PluginEntryFn;
#[cfg(feature = "native")]
use crate::abi::PLUGIN_ENTRY_SYMBOL;
use keel_core::Result;
#[cfg(feature = "native")]
use keel_core::KeelError;

/// An open code module. Dropping it releases the handle.
pub trait Module: Send {
    fn path(&self) -> &Path;

    /// Resolve the plugin entry symbol.
    ///
    /// The returned pointer is only valid while `self` is alive.
    fn entry(&self) -> Result<PluginEntryFn>;
}

/// Opens modules found during discovery.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Module>>;
}

/// Loads shared libraries from disk with `libloading`.
#[cfg(feature = "native")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

#[cfg(feature = "native")]
impl ModuleLoader for NativeLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn Module>> {
        // SAFETY: loading runs the library's initializers; only modules that
        // passed the trust gate reach this point.
        let library =
            unsafe { libloading::Library::new(path) }.map_err(|e| KeelError::ModuleOpen {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(NativeModule {
            library,
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(feature = "native")]
struct NativeModule {
    library: libloading::Library,
    path: PathBuf,
}

#[cfg(feature = "native")]
impl Module for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self) -> Result<PluginEntryFn> {
        // SAFETY: the symbol is declared with the entry signature by the module contract.
        let symbol: libloading::Symbol<'_, PluginEntryFn> = unsafe {
            self.library.get(PLUGIN_ENTRY_SYMBOL)
        }
        .map_err(|_| KeelError::MissingEntry {
            path: self.path.clone(),
            symbol: symbol_name(),
        })?;
        Ok(*symbol)
    }
}

#[cfg(feature = "native")]
impl Drop for NativeModule {
    fn drop(&mut self) {
        tracing::debug!(path = ?self.path, "closing module");
    }
}

/// Entry symbol name without the trailing NUL.
pub fn symbol_name() -> String {
    let bytes = crate::abi::PLUGIN_ENTRY_SYMBOL;
    String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned()
}

/// Collect candidate module files under `dir`, recursively, in a stable order.
pub fn candidates(dir: &Path, extension: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_name_strips_nul() {
        assert_eq!(symbol_name(), "PluginInit");
    }

    #[test]
    fn candidates_filter_by_extension_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("b.so"), b"").unwrap();
        std::fs::write(dir.path().join("a.so"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::write(dir.path().join("a.manifest.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("nested/deeper/c.so"), b"").unwrap();

        let found: Vec<_> = candidates(dir.path(), "so")
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("a.so"),
                PathBuf::from("b.so"),
                PathBuf::from("nested/deeper/c.so"),
            ]
        );
    }

    #[test]
    fn candidates_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(candidates(&dir.path().join("absent"), "so").is_empty());
    }

    #[cfg(feature = "native")]
    #[test]
    fn native_loader_rejects_non_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.so");
        std::fs::write(&path, b"definitely not an ELF file").unwrap();
        let err = NativeLoader.open(&path).err().unwrap();
        assert!(err.is_load_error());
        assert!(matches!(err, KeelError::ModuleOpen { .. }));
    }

    #[cfg(all(feature = "native", target_os = "linux"))]
    #[test]
    fn native_module_without_entry_symbol() {
        let Some(libm) = [
            "/lib/x86_64-linux-gnu/libm.so.6",
            "/usr/lib/x86_64-linux-gnu/libm.so.6",
            "/lib/aarch64-linux-gnu/libm.so.6",
            "/usr/lib64/libm.so.6",
            "/lib64/libm.so.6",
            "/usr/lib/libm.so.6",
        ]
        .into_iter()
        .map(Path::new)
        .find(|p| p.exists()) else {
            return;
        };
        let module = NativeLoader.open(libm).unwrap();
        assert_eq!(module.path(), libm);
        match module.entry() {
            Err(KeelError::MissingEntry { path, symbol }) => {
                assert_eq!(path, libm);
                assert_eq!(symbol, "PluginInit");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("libm exports no plugin entry"),
        }
    }
}
