//! Déroulé du pairing initial.
//!
//! 1. demander un code au plan de contrôle et l'afficher à l'écran
//! 2. interroger le statut jusqu'à confirmation par l'opérateur
//! 3. générer la clé P-256, soumettre la CSR avec le code
//! 4. installer les certificats reçus et persister le device id
//!
//! Le pairing est idempotent côté plan de contrôle : re-soumettre un
//! code déjà complété répond soit la même identité, soit
//! « déjà appairé », traité comme un succès si le matériel local est
//! complet.

use crate::state::PlayerState;
use crate::surface::RenderSurface;
use crate::{PlayerError, Result};
use panoapi::{ApiError, ControlPlaneClient};
use panoconfig::Config;
use panoidentity::IdentityStore;
use panotransport::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cadence d'interrogation du statut de pairing.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Mène le pairing jusqu'à une identité installée.
///
/// Retourne le device id attribué. Publie les états intermédiaires
/// (`pairing-requested`, `waiting-confirmation`) sur `state_tx`.
///
/// # Arguments
///
/// * `api` - Client du plan de contrôle (canal sans certificat client)
/// * `identity` - Magasin de clés et certificats
/// * `config` - Configuration (device id persisté à l'issue)
/// * `surface` - Surface de rendu, pour afficher le code
/// * `state_tx` - Publication de l'état de l'agent
/// * `shutdown` - Annulation coopérative
pub async fn ensure_paired(
    api: &ControlPlaneClient,
    identity: &IdentityStore,
    config: &Arc<Config>,
    surface: &Arc<dyn RenderSurface>,
    state_tx: &watch::Sender<PlayerState>,
    shutdown: &CancellationToken,
) -> Result<String> {
    let device_uuid = config
        .get_device_uuid()
        .map_err(|e| PlayerError::Config(e.to_string()))?;
    let description = config
        .get_device_description()
        .map_err(|e| PlayerError::Config(e.to_string()))?;

    let mut backoff = Backoff::transport();

    loop {
        if shutdown.is_cancelled() {
            return Err(PlayerError::Fatal("shutdown during pairing".into()));
        }

        match pairing_round(
            api,
            identity,
            config,
            surface,
            state_tx,
            shutdown,
            &device_uuid,
            &description,
        )
        .await
        {
            Ok(device_id) => return Ok(device_id),
            Err(PlayerError::Fatal(reason)) => return Err(PlayerError::Fatal(reason)),
            Err(e) => {
                warn!(error = %e, "Pairing round failed, retrying");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        return Err(PlayerError::Fatal("shutdown during pairing".into()))
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pairing_round(
    api: &ControlPlaneClient,
    identity: &IdentityStore,
    config: &Arc<Config>,
    surface: &Arc<dyn RenderSurface>,
    state_tx: &watch::Sender<PlayerState>,
    shutdown: &CancellationToken,
    device_uuid: &str,
    description: &str,
) -> Result<String> {
    // 1. Demander et afficher le code
    let pairing = api.request_pairing(device_uuid, description).await?;
    info!(code = %pairing.pairing_code, "Pairing code issued, waiting for operator");
    let _ = state_tx.send(PlayerState::PairingRequested);

    if let Err(e) = surface.show_pairing_code(&pairing.pairing_code).await {
        warn!(error = %e, "Could not display pairing code");
    }

    let _ = state_tx.send(PlayerState::WaitingConfirmation);

    // 2. Attendre la confirmation, bornée par l'expiration du code
    loop {
        if let Some(expires_at) = pairing.expires_at {
            if chrono::Utc::now() > expires_at {
                return Err(PlayerError::Config("pairing code expired".into()));
            }
        }

        match api.pairing_status(device_uuid).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) if e.is_offline() => {
                warn!(error = %e, "Pairing status probe failed, will retry");
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(PlayerError::Fatal("shutdown during pairing".into()))
            }
            _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
        }
    }

    // 3. Clé + CSR. Le common name s'engage sur le nom local : le
    // device id définitif n'est connu qu'à la réponse.
    identity.generate_key()?;
    let csr = identity.create_csr(device_uuid)?;

    let completed = match api.complete_pairing(&pairing.pairing_code, &csr).await {
        Ok(completed) => completed,
        Err(ApiError::AlreadyPaired) => {
            // Le matériel local doit déjà être complet, sinon le code
            // est irrécupérable
            return match (identity.load(), config.get_device_id()) {
                (Ok(_), Ok(Some(device_id))) => Ok(device_id),
                _ => Err(PlayerError::Fatal(
                    "control plane reports already-paired but local identity is incomplete".into(),
                )),
            };
        }
        Err(e) => return Err(e.into()),
    };

    // 4. Installer le matériel et persister le device id
    identity.install_certificates(&completed.client_cert, &completed.ca_cert)?;
    config
        .set_device_id(&completed.device_id)
        .map_err(|e| PlayerError::Config(e.to_string()))?;

    info!(device_id = %completed.device_id, "Device paired and identity installed");
    Ok(completed.device_id)
}
