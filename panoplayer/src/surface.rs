//! Couture vers la surface de rendu.
//!
//! Le cœur ne décode ni ne compose rien : il émet « présente cet item
//! maintenant » et la surface (fenêtre kiosque, compositeur) exécute.
//! L'implémentation vit hors du cœur ; les tests utilisent une surface
//! en mémoire.

use panosnapshot::PlaylistItem;
use std::path::PathBuf;
use std::time::Duration;

/// Demande de présentation émise vers la surface.
#[derive(Debug, Clone)]
pub struct PresentRequest {
    pub item: PlaylistItem,
    /// Chemin local du média, `None` pour un item de type `url`
    pub media_path: Option<PathBuf>,
    /// Durée de la transition visuelle d'entrée
    pub transition: Duration,
}

/// Surface de rendu pilotée par le contrôleur.
#[async_trait::async_trait]
pub trait RenderSurface: Send + Sync {
    /// Présente un item plein écran.
    async fn present(&self, request: PresentRequest) -> std::result::Result<(), String>;

    /// Écran noir (fenêtre d'extinction du power schedule).
    async fn blank(&self) -> std::result::Result<(), String>;

    /// Mire de diagnostic.
    async fn show_test_pattern(&self) -> std::result::Result<(), String>;

    /// Diapositive d'erreur terminale, sans arrêter l'agent.
    async fn show_error_slide(&self, message: &str) -> std::result::Result<(), String>;

    /// Affiche le code de pairing à l'opérateur.
    async fn show_pairing_code(&self, code: &str) -> std::result::Result<(), String>;

    /// Capture l'image affichée (commande screenshot), PNG.
    async fn capture_frame(&self) -> std::result::Result<bytes::Bytes, String>;
}
