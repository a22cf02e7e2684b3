//! Surface de rendu par défaut.
//!
//! Le décodage et la composition plein écran vivent dans le renderer
//! kiosque, un processus séparé. Ce binaire embarque une surface de
//! journalisation : chaque demande de présentation est tracée, ce qui
//! permet de faire tourner l'agent sans affichage (CI, machines de
//! test) et sert de point d'attache documenté pour un vrai renderer.

use panoplayer::{PresentRequest, RenderSurface};
use tracing::info;

pub struct LoggingSurface;

#[async_trait::async_trait]
impl RenderSurface for LoggingSurface {
    async fn present(&self, request: PresentRequest) -> Result<(), String> {
        info!(
            item_id = %request.item.item_id,
            media = ?request.media_path,
            duration_ms = request.item.duration.as_millis() as u64,
            transition_ms = request.transition.as_millis() as u64,
            "PRESENT"
        );
        Ok(())
    }

    async fn blank(&self) -> Result<(), String> {
        info!("BLANK");
        Ok(())
    }

    async fn show_test_pattern(&self) -> Result<(), String> {
        info!("TEST PATTERN");
        Ok(())
    }

    async fn show_error_slide(&self, message: &str) -> Result<(), String> {
        info!(message, "ERROR SLIDE");
        Ok(())
    }

    async fn show_pairing_code(&self, code: &str) -> Result<(), String> {
        info!(code, "PAIRING CODE");
        Ok(())
    }

    async fn capture_frame(&self) -> Result<bytes::Bytes, String> {
        Err("no renderer attached, cannot capture".to_string())
    }
}
