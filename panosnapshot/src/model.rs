//! Modèle normalisé et validation des snapshots.

use crate::{Result, SnapshotError};
use panoapi::{PlaylistItemPayload, SnapshotPayload};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Type de média d'un item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Document,
    Url,
}

impl MediaType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaType::Image),
            "video" => Some(MediaType::Video),
            "document" => Some(MediaType::Document),
            "url" => Some(MediaType::Url),
            _ => None,
        }
    }
}

/// Mode d'ajustement du média dans l'écran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    #[default]
    Contain,
    Cover,
    Stretch,
}

impl FitMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "contain" => Some(FitMode::Contain),
            "cover" => Some(FitMode::Cover),
            "stretch" => Some(FitMode::Stretch),
            _ => None,
        }
    }
}

/// Unité de présentation normalisée.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub item_id: String,
    /// Référence média, absente pour les items de type `url`
    pub media_id: Option<String>,
    pub media_type: MediaType,
    /// Durée d'affichage, strictement positive
    pub duration: Duration,
    pub fit: FitMode,
    pub muted: bool,
    /// Durée de la transition vers l'item suivant
    pub transition: Duration,
    pub source_url: Option<String>,
    /// Empreinte SHA-256 attendue du média
    pub digest: Option<String>,
    /// Taille annoncée en octets
    pub size: Option<u64>,
    /// URL de téléchargement résolue depuis la carte média du snapshot
    pub download_url: Option<String>,
}

/// Snapshot normalisé : la décision complète de diffusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub schedule_id: String,
    pub version: u64,
    pub items: Vec<PlaylistItem>,
    /// Préempte la grille tant qu'il est présent
    pub emergency: Option<PlaylistItem>,
    /// Affiché quand la grille est vide
    pub default_item: Option<PlaylistItem>,
}

impl Snapshot {
    /// Items effectivement à précharger : la grille, plus l'urgence et
    /// le défaut s'ils référencent un média.
    pub fn prefetchable_items(&self) -> Vec<&PlaylistItem> {
        let mut items: Vec<&PlaylistItem> = Vec::new();
        if let Some(emergency) = &self.emergency {
            items.push(emergency);
        }
        items.extend(self.items.iter());
        if let Some(default_item) = &self.default_item {
            items.push(default_item);
        }
        items.into_iter().filter(|i| i.media_id.is_some()).collect()
    }
}

/// Valide et normalise une charge utile de snapshot.
///
/// Fonction pure : des octets identiques produisent la même décision
/// d'acceptation et la même playlist normalisée.
///
/// # Arguments
///
/// * `payload` - Charge utile brute du plan de contrôle
/// * `allowed_domains` - Domaines autorisés pour les items `url`
///
/// # Errors
///
/// [`SnapshotError::Validation`] si un champ obligatoire manque, si un
/// type de média est inconnu, si une durée est nulle ou si un item `url`
/// pointe hors des domaines autorisés.
pub fn normalize(payload: &SnapshotPayload, allowed_domains: &[String]) -> Result<Snapshot> {
    if payload.schedule_id.is_empty() {
        return Err(SnapshotError::Validation("empty schedule_id".into()));
    }

    let items = payload
        .items
        .iter()
        .map(|item| normalize_item(item, payload, allowed_domains))
        .collect::<Result<Vec<_>>>()?;

    let emergency = payload
        .emergency
        .as_ref()
        .map(|item| normalize_item(item, payload, allowed_domains))
        .transpose()?;

    let default_item = payload
        .default
        .as_ref()
        .map(|item| normalize_item(item, payload, allowed_domains))
        .transpose()?;

    Ok(Snapshot {
        snapshot_id: payload.snapshot_id.clone(),
        schedule_id: payload.schedule_id.clone(),
        version: payload.version,
        items,
        emergency,
        default_item,
    })
}

fn normalize_item(
    item: &PlaylistItemPayload,
    payload: &SnapshotPayload,
    allowed_domains: &[String],
) -> Result<PlaylistItem> {
    if item.item_id.is_empty() {
        return Err(SnapshotError::Validation("item without item_id".into()));
    }

    let media_type = MediaType::parse(&item.media_type).ok_or_else(|| {
        SnapshotError::Validation(format!(
            "unknown media type '{}' for item {}",
            item.media_type, item.item_id
        ))
    })?;

    if item.duration_ms == 0 {
        return Err(SnapshotError::Validation(format!(
            "item {} has zero duration",
            item.item_id
        )));
    }

    match media_type {
        MediaType::Url => {
            let source = item.source_url.as_deref().ok_or_else(|| {
                SnapshotError::Validation(format!("url item {} without source_url", item.item_id))
            })?;
            check_allowed_domain(source, allowed_domains, &item.item_id)?;
        }
        _ => {
            if item.media_id.is_none() {
                return Err(SnapshotError::Validation(format!(
                    "item {} without media_id",
                    item.item_id
                )));
            }
        }
    }

    let fit = match item.fit.as_deref() {
        None => FitMode::default(),
        Some(s) => FitMode::parse(s).ok_or_else(|| {
            SnapshotError::Validation(format!("unknown fit mode '{}' for item {}", s, item.item_id))
        })?,
    };

    let download_url = item
        .media_id
        .as_ref()
        .and_then(|id| payload.media_urls.get(id).cloned());

    Ok(PlaylistItem {
        item_id: item.item_id.clone(),
        media_id: item.media_id.clone(),
        media_type,
        duration: Duration::from_millis(item.duration_ms),
        fit,
        muted: item.muted,
        transition: Duration::from_millis(item.transition_ms),
        source_url: item.source_url.clone(),
        digest: item.digest.clone(),
        size: item.size,
        download_url,
    })
}

fn check_allowed_domain(source: &str, allowed_domains: &[String], item_id: &str) -> Result<()> {
    let parsed = url::Url::parse(source)
        .map_err(|e| SnapshotError::Validation(format!("item {}: invalid URL: {}", item_id, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SnapshotError::Validation(format!("item {}: URL without host", item_id)))?;

    let allowed = allowed_domains
        .iter()
        .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));

    if allowed {
        Ok(())
    } else {
        Err(SnapshotError::Validation(format!(
            "item {}: domain '{}' is not allowed",
            item_id, host
        )))
    }
}
