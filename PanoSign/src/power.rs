//! Fenêtre d'allumage programmée.
//!
//! Quand le power schedule est activé, l'écran n'affiche du contenu
//! qu'entre l'heure d'allumage et l'heure d'extinction (heures locales,
//! format HH:MM). La tâche publie l'état de la fenêtre sur un canal
//! `watch` ; le contrôleur met la lecture en pause et éteint l'écran en
//! dehors de la fenêtre.

use chrono::{Local, NaiveTime, Timelike};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Parse une heure `HH:MM`.
fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Vrai si `now` est dans la fenêtre `[on, off)`, fenêtres de nuit
/// (off < on) comprises.
fn in_window(now: NaiveTime, on: NaiveTime, off: NaiveTime) -> bool {
    if on == off {
        // Fenêtre dégénérée : toujours allumé
        return true;
    }
    if on < off {
        now >= on && now < off
    } else {
        // Fenêtre chevauchant minuit (ex: 18:00 → 02:00)
        now >= on || now < off
    }
}

/// Tâche du power schedule.
///
/// Publie `true` (écran actif) ou `false` (fenêtre fermée) et se
/// réveille toutes les 30 secondes pour suivre l'horloge murale, y
/// compris après un changement d'heure.
pub async fn run_power_schedule(
    enabled: bool,
    on_time: String,
    off_time: String,
    power_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    if !enabled {
        let _ = power_tx.send(true);
        return;
    }

    let (Some(on), Some(off)) = (parse_time(&on_time), parse_time(&off_time)) else {
        warn!(on_time, off_time, "Invalid power schedule times, keeping display on");
        let _ = power_tx.send(true);
        return;
    };

    info!(%on, %off, "Power schedule active");

    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        let now = Local::now().time();
        // Seconde tronquée pour une comparaison stable
        let now = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
        let on_now = in_window(now, on, off);

        if *power_tx.borrow() != on_now {
            let _ = power_tx.send(on_now);
        }
    }
}
