//! # Ringtail Core
//!
//! Core engine for the Ringtail two-round threshold lattice signature
//! scheme.
//!
//! This crate provides the building blocks for:
//! - Per-party round computation (commitment and response shares)
//! - Untrusted combination of shares into a full signature
//! - Session coordination across a t-of-K deployment
//!
//! ## Protocol Overview
//!
//! Ringtail signs in two rounds. In round 1 each invited party publishes a
//! rounded commitment to fresh masking randomness, MAC'd pairwise so peers
//! can authenticate it through an untrusted relay. Once a threshold quorum
//! of commitments is in, the challenge is derived deterministically from
//! the message and the quorum's commitments, and each quorum member
//! answers with a response share binding its secret key share to the
//! challenge. Any threshold subset of valid shares combines into a
//! signature; no secret material ever leaves a party.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ringtail_core::{Coordinator, RingtailParams};
//!
//! let coordinator = Coordinator::new(params, public_key)?;
//! let session_id = coordinator.init_session(message, participants, timeout)?;
//! // Parties submit round outputs; await the combined signature
//! let result = coordinator.wait_for_signature(&session_id).await?;
//! ```

pub mod algebra;
pub mod challenge;
pub mod coordinator;
pub mod error;
pub mod keys;
pub mod mac;
pub mod net;
pub mod params;
pub mod party;
pub mod session;
pub mod sign;
pub mod types;
pub mod wire;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use params::RingtailParams;
pub use party::PartyService;
pub use types::{PartyId, SessionId, SessionStatus, ThresholdSignature};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default threshold for a 5-party setup
pub const DEFAULT_THRESHOLD: usize = 3;

/// Default number of parties
pub const DEFAULT_PARTIES: usize = 5;
