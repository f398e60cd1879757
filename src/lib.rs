//! Client-side synchronization for a journaling backend: streamed replies
//! folded into a message log, and polling of entries the server enriches.

// Interdiction stricte de pratiques dangereuses ou non idiomatiques
#![deny(unsafe_code)] // Le code unsafe est interdit
#![deny(missing_docs)] // Toute fonction, struct, enum ou module public doit être documenté
#![deny(non_camel_case_types)]
// Les types doivent suivre la convention CamelCase

// Options supplémentaires pour ne rien laisser passer
#![deny(unused_must_use)] // Oblige à gérer explicitement les Result et Option
#![deny(non_snake_case)] // Les noms de variables et fonctions doivent être en snake_case
#![deny(non_upper_case_globals)] // Les constantes et globals doivent être en MAJUSCULE
#![deny(nonstandard_style)] // Empêche tout style de code non standard
#![forbid(unsafe_op_in_unsafe_fn)]

// Clippy pour stricte discipline
#![deny(clippy::all)] // Active toutes les lints Clippy standard
#![deny(clippy::unwrap_used)] // Interdit unwrap()
#![deny(clippy::expect_used)] // Interdit expect()
#![deny(clippy::panic)] // Interdit panic!()
#![deny(clippy::print_stdout)] // Interdit println!() en production
#![deny(clippy::todo)] // Interdit les TODO dans le code
#![deny(clippy::unimplemented)] // Interdit les fonctions non implémentées
#![deny(clippy::unwrap_in_result)] // Interdit unwrap() sur Result
#![deny(clippy::module_inception)] // Interdit un module ayant le même nom que le crate
#![deny(clippy::redundant_clone)] // Interdit les clones inutiles
#![deny(clippy::too_many_arguments)] // Limite le nombre d’arguments des fonctions
// Les tests utilisent unwrap() et panic!() pour signaler les échecs
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Lints pour sécurité et robustesse
#![deny(overflowing_literals)] // Interdit les littéraux qui débordent

/// View controllers (mind search, entry composer, insights).
pub mod controllers;
/// Configuration, errors, and identifiers.
pub mod core;
/// Message log and streaming reducer.
pub mod messages;
/// User-visible notices.
pub mod notify;
/// Poll reconciliation of server-enriched entities.
pub mod polling;
/// Speech recognition and synthesis capabilities.
pub mod speech;
/// Entry helpers for the command-line client.
pub mod start_journal_sync;
/// Transport capabilities and their HTTP implementation.
pub mod transport;

pub use crate::core::{ClientConfig, EntityId, MessageId, SyncError, SyncResult};
pub use crate::messages::{MessageLog, StreamingMessageReducer};
pub use crate::polling::{CompletionPredicate, PollHandle, PollableEntity, PollingReconciler};
