//! Écritures disque atomiques et gestion des permissions.
//!
//! Toutes les écritures persistantes de PanoSign suivent la même
//! discipline : écriture dans un fichier temporaire du même répertoire,
//! `sync` puis `rename`. Un crash au milieu d'une écriture laisse donc
//! soit l'ancien fichier intact, soit le nouveau complet.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Crée un répertoire (et ses parents) si nécessaire.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {:?}", dir))
}

/// Crée un répertoire accessible uniquement par son propriétaire (0700).
///
/// Utilisé pour le répertoire des secrets (clés et certificats).
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    ensure_dir(dir)?;
    #[cfg(unix)]
    {
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(dir, perms)
            .with_context(|| format!("Failed to restrict permissions on {:?}", dir))?;
    }
    Ok(())
}

/// Écrit `data` dans `path` de façon atomique.
///
/// Le contenu passe par un fichier temporaire `<nom>.tmp.<pid>` dans le
/// même répertoire, synchronisé sur disque avant le `rename` final.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    atomic_write_impl(path, data, None)
}

/// Écrit `data` dans `path` de façon atomique avec un mode Unix explicite.
///
/// # Arguments
///
/// * `path` - Destination finale
/// * `data` - Contenu complet du fichier
/// * `mode` - Permissions Unix (ex: `0o600` pour une clé privée)
pub fn atomic_write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    atomic_write_impl(path, data, Some(mode))
}

fn atomic_write_impl(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path {:?} has no parent directory", path))?;
    ensure_dir(parent)?;

    let file_name = path
        .file_name()
        .with_context(|| format!("Path {:?} has no file name", path))?
        .to_string_lossy()
        .to_string();
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file {:?}", tmp_path))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            file.set_permissions(fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set mode {:o} on {:?}", mode, tmp_path))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        file.write_all(data)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {:?}", tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {:?} into {:?}", tmp_path, path))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("data.json");

        atomic_write(&path, b"{\"ok\":true}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{\"ok\":true}");
        // Aucun fichier temporaire ne doit subsister
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.key");

        atomic_write_with_mode(&path, b"PEM", 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
