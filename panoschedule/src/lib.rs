//! # panoschedule - Échéancier de présentation
//!
//! Convertit une playlist normalisée en évènements de présentation :
//!
//! - les débuts planifiés sont calculés sur l'horloge monotone (les
//!   suspensions machine ne cassent pas la timeline) ; un début observé
//!   n'est jamais antérieur au début planifié
//! - chaque item porte deux échéances : la transition (durée moins durée
//!   de transition) et la fin ; en fin de liste, l'échéancier reboucle à
//!   l'index 0
//! - le jitter (début observé moins début planifié) est suivi sur une
//!   fenêtre glissante ; un écart unitaire au-delà de 100 ms émet un
//!   avertissement
//! - `pause` gèle la durée restante de l'item courant, `resume`
//!   replanifie depuis l'instant monotone courant ; les deux sont
//!   idempotents

mod scheduler;

pub use scheduler::{
    ScheduledEvent, SchedulerStats, TimelineEvent, TimelineScheduler, JITTER_WARN_MS,
};
