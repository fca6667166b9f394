//! File checkpoints: the core wire record written to and read from disk.

use std::fs;
use std::path::Path;

use tm_core::{MemoryModel, export_bytes, import_bytes, restore_json};

use crate::error::{Result, StoreError};

/// Write every parameter array of `model` to `path`, creating parent
/// directories as needed.
pub fn save_model(model: &MemoryModel, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let bytes = export_bytes(model)?;
    fs::write(path, &bytes).map_err(|e| StoreError::io(path, e))?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "saved model");
    Ok(())
}

/// Overwrite `model`'s parameters from the checkpoint at `path`.
pub fn load_model(model: &mut MemoryModel, path: &Path) -> Result<()> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    import_bytes(model, &bytes)?;
    tracing::info!(path = %path.display(), "loaded model");
    Ok(())
}

/// Build a new model from the checkpoint at `path`, using its stored config.
pub fn restore_model(path: &Path) -> Result<MemoryModel> {
    let json = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    Ok(restore_json(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use tempfile::TempDir;
    use tm_core::{ModelConfig, ModelError};

    fn make_model(seed: u64, memory_dim: usize) -> MemoryModel {
        let mut rng = SmallRng::seed_from_u64(seed);
        MemoryModel::new(ModelConfig::with_dims(3, 4, memory_dim), &mut rng).unwrap()
    }

    #[test]
    fn test_save_creates_parents_and_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/model.json");
        let original = make_model(1, 2);
        save_model(&original, &path).unwrap();

        let mut loaded = make_model(2, 2);
        load_model(&mut loaded, &path).unwrap();
        assert_eq!(loaded.weights(), original.weights());

        let restored = restore_model(&path).unwrap();
        assert_eq!(restored.config(), original.config());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        let mut model = make_model(1, 2);
        let err = load_model(&mut model, &path).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }), "{err}");
        assert!(err.to_string().contains("absent.json"));
        assert!(matches!(restore_model(&path), Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_shape_mismatch_surfaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        save_model(&make_model(1, 2), &path).unwrap();

        let mut wider = make_model(1, 3);
        let err = load_model(&mut wider, &path).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Model(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.json");
        fs::write(&path, "not a checkpoint").unwrap();
        let mut model = make_model(1, 2);
        let err = load_model(&mut model, &path).unwrap_err();
        assert!(matches!(err, StoreError::Model(ModelError::InvalidData(_))));
    }
}
