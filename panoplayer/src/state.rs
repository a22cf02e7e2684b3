//! Machine à états de l'agent.

use serde_json::Value;

/// Mode de fonctionnement courant de l'agent. Exactement un état est
/// actif à tout instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Démarrage, rien n'est encore décidé
    Boot,
    /// Aucune identité : l'écran attend un pairing
    NeedPairing,
    /// Un code de pairing a été demandé et affiché
    PairingRequested,
    /// Le code est saisi côté opérateur, l'écran attend la confirmation
    WaitingConfirmation,
    /// Identité installée, pas encore de lecture
    CertIssued,
    /// Lecture normale de la grille
    PlaybackRunning,
    /// Lecture depuis le cache, plan de contrôle injoignable
    OfflineFallback,
    /// L'item d'urgence préempte la grille
    Emergency,
    /// Grille vide : item par défaut ou écran noir
    Empty,
    /// Erreur fatale, ré-initialisation planifiée sous backoff
    Error,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Boot => "boot",
            PlayerState::NeedPairing => "need-pairing",
            PlayerState::PairingRequested => "pairing-requested",
            PlayerState::WaitingConfirmation => "waiting-confirmation",
            PlayerState::CertIssued => "cert-issued",
            PlayerState::PlaybackRunning => "playback-running",
            PlayerState::OfflineFallback => "offline-fallback",
            PlayerState::Emergency => "emergency",
            PlayerState::Empty => "empty",
            PlayerState::Error => "error",
        }
    }

    /// Vrai si du contenu est présenté dans cet état.
    pub fn is_presenting(&self) -> bool {
        matches!(
            self,
            PlayerState::PlaybackRunning
                | PlayerState::OfflineFallback
                | PlayerState::Emergency
                | PlayerState::Empty
        )
    }

    pub fn to_json(&self) -> Value {
        Value::String(self.as_str().to_string())
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
